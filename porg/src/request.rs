// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use once_cell::sync::Lazy;
use reqwest::Result;
use url::Url;

/// Shared client for tcp socket reuse and connection limit
static CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::ClientBuilder::new()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(30))
        .build()
        .expect("build reqwest client")
});

/// Fetch a resource at the provided [`Url`] and stream its response bytes
pub async fn get(url: Url) -> Result<impl Stream<Item = Result<Bytes>>> {
    let response = CLIENT.get(url.as_str()).send().await?;

    response.error_for_status().map(reqwest::Response::bytes_stream)
}
