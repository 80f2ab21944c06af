// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{cell::RefCell, future::Future, io};

use tokio::runtime;

thread_local! {
    static RUNTIME: RefCell<Option<Runtime>> = const { RefCell::new(None) };
}

/// Initialise the runtime for the current thread.
///
/// Thread local so parallel batch builds each own their runtime, and
/// so dropping the [`Guard`] before cloning into the build container
/// reliably leaves no executor threads behind.
pub fn init() -> Guard {
    RUNTIME.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            *slot = Some(Runtime::new().expect("build runtime"));
        }
    });
    Guard
}

fn destroy() {
    RUNTIME.with(|cell| {
        let _ = cell.borrow_mut().take();
    });
}

/// The Guard provides a scoped token to utilise the Runtime
#[must_use = "runtime is dropped with guard"]
pub struct Guard;

impl Drop for Guard {
    fn drop(&mut self) {
        destroy();
    }
}

/// Lifetime management handle for the runtime
struct Runtime(runtime::Runtime);

impl Runtime {
    /// Construct a new Runtime on the current thread
    fn new() -> io::Result<Self> {
        Ok(Self(runtime::Builder::new_current_thread().enable_all().build()?))
    }
}

/// Run the provided future on this thread's runtime.
pub fn block_on<T, F>(task: F) -> T
where
    F: Future<Output = T>,
{
    RUNTIME.with(|cell| {
        let slot = cell.borrow();
        let rt = slot.as_ref().expect("runtime initialized");
        rt.0.block_on(task)
    })
}
