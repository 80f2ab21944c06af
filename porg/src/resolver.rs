// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Dependency resolution over the ports tree plus the installed set.
//!
//! Recipes are loaded lazily as the walk discovers them. Ordering
//! always comes from the same place: a [`dag::Dag`] topological sort
//! with dependencies first and name-sorted siblings, so runs are
//! reproducible.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::db::{self, Database, Record};
use crate::environment::CRITICAL_PREFIXES;
use crate::ports;
use crate::recipe::Recipe;
use crate::version;

#[derive(Debug, Clone)]
pub enum Scope {
    Single(String),
    World,
}

#[derive(Debug, Clone, Default)]
pub struct UpgradePlan {
    /// Topological order over the chosen subgraph
    pub upgrade_order: Vec<String>,
    /// Subset of the order that actually needs a rebuild
    pub needs_rebuild: Vec<String>,
}

pub struct Resolver<'a> {
    ports: &'a ports::Tree,
    db: &'a Database,
    recipes: HashMap<String, Recipe>,
    absent: HashSet<String>,
}

impl<'a> Resolver<'a> {
    pub fn new(ports: &'a ports::Tree, db: &'a Database) -> Self {
        Self {
            ports,
            db,
            recipes: HashMap::new(),
            absent: HashSet::new(),
        }
    }

    /// Cached recipe lookup; `None` when the tree has no recipe
    pub fn recipe(&mut self, name: &str) -> Option<&Recipe> {
        if self.absent.contains(name) {
            return None;
        }

        if !self.recipes.contains_key(name) {
            match self.ports.load(name) {
                Ok(recipe) => {
                    self.recipes.insert(name.to_owned(), recipe);
                }
                Err(_) => {
                    self.absent.insert(name.to_owned());
                    return None;
                }
            }
        }

        self.recipes.get(name)
    }

    /// Topological order sufficient to install `name`: every
    /// dependency appears before its dependents, `name` comes last.
    ///
    /// A dependency without a recipe is fine while it is installed;
    /// otherwise it is a [`Error::MissingRecipe`].
    pub fn resolve(&mut self, name: &str) -> Result<Vec<String>, Error> {
        if self.recipe(name).is_none() {
            return Err(Error::MissingRecipe(name.to_owned()));
        }

        let mut graph = dag::Dag::new();
        let mut queue = vec![name.to_owned()];
        let mut seen = HashSet::new();

        while let Some(current) = queue.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }

            graph.add_node(current.clone());

            let Some(recipe) = self.recipe(&current) else {
                continue;
            };

            let deps = recipe
                .parsed
                .dependencies
                .for_build()
                .map(str::to_owned)
                .collect::<Vec<_>>();

            for dep in deps {
                if self.recipe(&dep).is_none() && !self.db.is_installed(&dep) {
                    return Err(Error::MissingRecipe(dep));
                }

                graph.add_dependency(current.clone(), dep.clone());
                queue.push(dep);
            }
        }

        graph
            .topo_sort([name.to_owned()])
            .map_err(|cycle| Error::CycleDetected(cycle.path))
    }

    /// Transitive dependency set of `name` minus the installed set
    pub fn missing(&mut self, name: &str) -> Result<Vec<String>, Error> {
        Ok(self
            .resolve(name)?
            .into_iter()
            .filter(|dep| dep != name && !self.db.is_installed(dep))
            .collect())
    }

    /// Installed records directly depending on `name`
    pub fn reverse_dependents(&self, name: &str) -> Result<Vec<Record>, Error> {
        Ok(self
            .db
            .list()?
            .into_iter()
            .filter(|record| record.dependencies.iter().any(|dep| dep == name))
            .collect())
    }

    /// Installed records nothing depends on, excluding the critical
    /// prefixes that are never safe to tear down
    pub fn orphans(&self) -> Result<Vec<Record>, Error> {
        let records = self.db.list()?;

        let mut dependencies = HashSet::new();
        for record in &records {
            dependencies.extend(record.dependencies.iter().cloned());
        }

        Ok(records
            .into_iter()
            .filter(|record| !dependencies.contains(&record.name))
            .filter(|record| {
                !CRITICAL_PREFIXES
                    .iter()
                    .any(|critical| record.prefix == std::path::Path::new(critical))
            })
            .collect())
    }

    /// Plan an upgrade over `scope`.
    ///
    /// A package needs a rebuild when the tree carries a newer version
    /// than the installed one, or when any transitive runtime
    /// dependency was rebuilt after it (directly, by timestamp, or
    /// within this very plan).
    pub fn upgrade_plan(&mut self, scope: Scope) -> Result<UpgradePlan, Error> {
        let records = self.db.list()?;
        let by_name: HashMap<String, Record> = records.iter().map(|r| (r.name.clone(), r.clone())).collect();

        // The chosen subgraph: a single target and its installed
        // dependents, or the whole installed world
        let members: HashSet<String> = match &scope {
            Scope::World => by_name.keys().cloned().collect(),
            Scope::Single(name) => {
                if !by_name.contains_key(name) && self.recipe(name).is_none() {
                    return Err(Error::MissingRecipe(name.clone()));
                }

                let mut members = HashSet::new();
                let mut queue = vec![name.clone()];
                while let Some(current) = queue.pop() {
                    if !members.insert(current.clone()) {
                        continue;
                    }
                    for record in &records {
                        if record.dependencies.iter().any(|dep| *dep == current) {
                            queue.push(record.name.clone());
                        }
                    }
                }
                members
            }
        };

        let mut graph = dag::Dag::new();
        for name in &members {
            graph.add_node(name.clone());

            let recipe_deps = self
                .recipe(name)
                .map(|recipe| recipe.parsed.dependencies.for_build().map(str::to_owned).collect::<Vec<_>>())
                .unwrap_or_default();
            let record_deps = by_name
                .get(name)
                .map(|record| record.dependencies.clone())
                .unwrap_or_default();

            for dep in recipe_deps.into_iter().chain(record_deps) {
                if members.contains(&dep) {
                    graph.add_dependency(name.clone(), dep);
                }
            }
        }

        let order = graph.topo_sort_all().map_err(|cycle| Error::CycleDetected(cycle.path))?;

        // Walk dependencies-first, propagating rebuild reasons
        let mut flagged = HashSet::new();
        let mut newest_dep_ts: HashMap<String, DateTime<Utc>> = HashMap::new();

        for name in &order {
            let record = by_name.get(name);

            let version_newer = match (self.recipe(name).map(|r| r.version.clone()), record) {
                (Some(available), Some(installed)) => version::is_newer(&available, &installed.version),
                // Not installed yet but part of the plan: build it
                (Some(_), None) => true,
                (None, _) => false,
            };

            let mut dep_rebuilt = false;
            let mut newest = DateTime::<Utc>::MIN_UTC;

            for dep in graph.dependencies(name) {
                if flagged.contains(&dep) {
                    dep_rebuilt = true;
                }

                let dep_ts = by_name
                    .get(&dep)
                    .map(|r| r.installed_at)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                let dep_newest = newest_dep_ts.get(&dep).copied().unwrap_or(DateTime::<Utc>::MIN_UTC);
                newest = newest.max(dep_ts).max(dep_newest);
            }

            newest_dep_ts.insert(name.clone(), newest);

            let stale = record.map(|r| newest > r.installed_at).unwrap_or_default();

            if version_newer || dep_rebuilt || stale {
                flagged.insert(name.clone());
            }
        }

        let needs_rebuild = order.iter().filter(|name| flagged.contains(*name)).cloned().collect();

        Ok(UpgradePlan {
            upgrade_order: order,
            needs_rebuild,
        })
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no recipe found for {0}")]
    MissingRecipe(String),
    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),
    #[error("db")]
    Db(#[from] db::Error),
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::path::Path;

    use chrono::TimeDelta;
    use fs_err as fs;

    use super::*;

    struct Fixture {
        _temp: tempfile::TempDir,
        ports: ports::Tree,
        db: Database,
    }

    fn fixture(recipes: &[(&str, &str)]) -> Fixture {
        let temp = tempfile::tempdir().unwrap();

        let ports_dir = temp.path().join("ports");
        for (name, contents) in recipes {
            let dir = ports_dir.join("core").join(name);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("package.yml"), contents).unwrap();
        }

        Fixture {
            ports: ports::Tree::open(ports_dir),
            db: Database::open(temp.path().join("installed.json"), temp.path()),
            _temp: temp,
        }
    }

    fn install(db: &Database, name: &str, vers: &str, prefix: &str, deps: &[&str], age_days: i64) {
        db.register(Record {
            name: name.to_owned(),
            version: vers.to_owned(),
            prefix: prefix.into(),
            installed_at: Utc::now() - TimeDelta::days(age_days),
            dependencies: deps.iter().map(|d| (*d).to_owned()).collect(),
            metadata: BTreeMap::new(),
        })
        .unwrap();
    }

    #[test]
    fn resolve_orders_dependencies_first() {
        let fixture = fixture(&[
            ("app", "name: app\nversion: '1'\ndependencies:\n  build: [libb, liba]\n"),
            ("liba", "name: liba\nversion: '1'\ndependencies:\n  build: [libb]\n"),
            ("libb", "name: libb\nversion: '1'\n"),
        ]);

        let mut resolver = Resolver::new(&fixture.ports, &fixture.db);
        let order = resolver.resolve("app").unwrap();
        assert_eq!(order, vec!["libb", "liba", "app"]);
    }

    #[test]
    fn cycle_is_detected_with_path() {
        let fixture = fixture(&[
            ("a", "name: a\nversion: '1'\ndependencies:\n  build: [b]\n"),
            ("b", "name: b\nversion: '1'\ndependencies:\n  build: [c]\n"),
            ("c", "name: c\nversion: '1'\ndependencies:\n  build: [a]\n"),
        ]);

        let mut resolver = Resolver::new(&fixture.ports, &fixture.db);
        let Err(Error::CycleDetected(path)) = resolver.resolve("a") else {
            panic!("expected cycle");
        };

        for node in ["a", "b", "c"] {
            assert!(path.iter().any(|n| n == node), "{node} missing from {path:?}");
        }
    }

    #[test]
    fn missing_recipe_propagates_verbatim() {
        let fixture = fixture(&[("app", "name: app\nversion: '1'\ndependencies:\n  build: [ghost]\n")]);

        let mut resolver = Resolver::new(&fixture.ports, &fixture.db);
        assert!(matches!(resolver.resolve("app"), Err(Error::MissingRecipe(name)) if name == "ghost"));
    }

    #[test]
    fn installed_dependency_without_recipe_is_satisfied() {
        let fixture = fixture(&[("app", "name: app\nversion: '1'\ndependencies:\n  build: [vendored]\n")]);
        install(&fixture.db, "vendored", "3.0", "/opt/vendored", &[], 10);

        let mut resolver = Resolver::new(&fixture.ports, &fixture.db);
        let order = resolver.resolve("app").unwrap();
        assert_eq!(order, vec!["vendored", "app"]);

        // And missing() excludes it
        assert!(resolver.missing("app").unwrap().is_empty());
    }

    #[test]
    fn world_plan_flags_dependents_of_upgrades() {
        let fixture = fixture(&[
            ("libfoo", "name: libfoo\nversion: '1.1'\n"),
            ("app", "name: app\nversion: '2.0'\ndependencies:\n  runtime: [libfoo]\n"),
        ]);
        install(&fixture.db, "libfoo", "1.0", "/opt/libfoo", &[], 10);
        install(&fixture.db, "app", "2.0", "/opt/app", &["libfoo"], 5);

        let mut resolver = Resolver::new(&fixture.ports, &fixture.db);
        let plan = resolver.upgrade_plan(Scope::World).unwrap();

        assert_eq!(plan.upgrade_order, vec!["libfoo", "app"]);
        assert_eq!(plan.needs_rebuild, vec!["libfoo", "app"]);
    }

    #[test]
    fn up_to_date_world_needs_nothing() {
        let fixture = fixture(&[("libfoo", "name: libfoo\nversion: '1.0'\n")]);
        install(&fixture.db, "libfoo", "1.0", "/opt/libfoo", &[], 1);

        let mut resolver = Resolver::new(&fixture.ports, &fixture.db);
        let plan = resolver.upgrade_plan(Scope::World).unwrap();
        assert!(plan.needs_rebuild.is_empty());
    }

    #[test]
    fn dependency_rebuilt_later_marks_package_stale() {
        let fixture = fixture(&[]);
        // libdep was reinstalled after app
        install(&fixture.db, "libdep", "1.0", "/opt/libdep", &[], 1);
        install(&fixture.db, "app", "1.0", "/opt/app", &["libdep"], 30);

        let mut resolver = Resolver::new(&fixture.ports, &fixture.db);
        let plan = resolver.upgrade_plan(Scope::World).unwrap();
        assert_eq!(plan.needs_rebuild, vec!["app"]);
    }

    #[test]
    fn reverse_dependents_and_orphans() {
        let fixture = fixture(&[]);
        install(&fixture.db, "libfoo", "1.0", "/opt/libfoo", &[], 2);
        install(&fixture.db, "app", "2.0", "/opt/app", &["libfoo"], 1);
        install(&fixture.db, "base", "1.0", "/usr", &[], 90);

        let resolver = Resolver::new(&fixture.ports, &fixture.db);

        let dependents = resolver.reverse_dependents("libfoo").unwrap();
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].key(), "app-2.0");

        // app is an orphan; libfoo has a dependent; base sits on a
        // critical prefix and is carved out
        let orphans = resolver.orphans().unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].name, "app");
        assert!(orphans.iter().all(|r| r.prefix != Path::new("/usr")));
    }
}
