//! Breadth-first resolution of the transitive dependency closure reachable
//! from a wishlist of root packages, classifying every reached package as
//! either *target-serving* (wheels must be downloaded) or *metadata-only*.
//!
//! Two distinct `==`-pinned versions of the same package reached through
//! different edges: first arrival wins. [`ClosureMap`] only ever inserts a
//! [`ResolvedPackage`] on first reach; a later edge with a different pin
//! can only participate in the monotone `needs_wheels` upgrade, never
//! replace the stored version. This mirrors the teacher's own
//! first-writer-wins `ClosureMap`-equivalent caches (e.g.
//! `puffin-client::SimpleMetadata`'s `BTreeMap::entry`) and is documented
//! behavior, not an oversight (spec.md §9, Open Question (b)).

mod environment;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use pep440_rs::{Operator, Version};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

pub use wheelhouse_client::Release;
use wheelhouse_client::{canonicalize, RegistryClient};
use wheelhouse_tags::Target;

/// A node in the closure: a specific resolved package and whether wheels
/// must be downloaded for it. A package whose metadata the registry
/// couldn't return is dropped before it ever reaches a `ResolvedPackage`
/// (spec.md §4.3/§7: "Missing metadata for a package... drop node,
/// continue") rather than stored as a phantom node, so `release` is always
/// populated once a node exists here. It remains an `Option` because
/// `ResolvedPackage::new` is also used outside BFS resolution, by the
/// update pipeline, to splice in entries it reconstructs itself.
#[derive(Debug, Clone)]
pub struct ResolvedPackage {
    pub canonical_name: String,
    pub version: Version,
    pub release: Option<Release>,
    needs_wheels: bool,
}

impl ResolvedPackage {
    /// Construct a package outside of BFS resolution -- used by the update
    /// pipeline to reconstruct a minimal entry for a wheel that survives
    /// from a prior mirror generation but fell out of the fresh closure
    /// (spec.md §4.6 step 2).
    pub fn new(canonical_name: String, version: Version, release: Option<Release>, needs_wheels: bool) -> Self {
        Self {
            canonical_name,
            version,
            release,
            needs_wheels,
        }
    }

    pub fn needs_wheels(&self) -> bool {
        self.needs_wheels
    }

    /// Upgrade `needs_wheels` to `true` if `reachable` says it should be;
    /// never flips it back to `false` (spec.md P3).
    fn upgrade_needs_wheels(&mut self, reachable: bool) {
        if reachable {
            self.needs_wheels = true;
        }
    }
}

/// `canonical-name -> ResolvedPackage`. Keyed by canonical name so BFS
/// inserts across a round commute; the emitter sorts at output time.
pub type ClosureMap = BTreeMap<String, ResolvedPackage>;

struct FrontierItem {
    name: String,
    pin: Option<String>,
    needs_wheels: bool,
}

/// Computes a [`ClosureMap`] from a wishlist of root package names.
pub struct Resolver {
    client: RegistryClient,
    targets: Vec<Target>,
    semaphore: Arc<Semaphore>,
}

impl Resolver {
    pub fn new(client: RegistryClient, targets: Vec<Target>) -> Self {
        Self {
            client,
            targets,
            semaphore: Arc::new(Semaphore::new(10)),
        }
    }

    /// Bound the number of concurrent `fetch_release`/`fetch_dependencies`
    /// calls a single BFS round fans out, per spec.md §4.3/§5 ("resolver:
    /// ~10 slots").
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        self
    }

    /// Run the BFS to completion: drain the frontier, round by round, until
    /// it is empty and no fetches are in flight.
    pub async fn resolve(&self, wishlist: &[String]) -> ClosureMap {
        let mut resolved: ClosureMap = ClosureMap::new();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut frontier: VecDeque<FrontierItem> = wishlist
            .iter()
            .map(|name| FrontierItem {
                name: name.clone(),
                pin: None,
                needs_wheels: true,
            })
            .collect();

        while !frontier.is_empty() {
            // Step 1: drain the frontier, filtering and monotone-upgrading.
            let mut survivors: Vec<FrontierItem> = Vec::new();
            while let Some(item) = frontier.pop_front() {
                let canonical = canonicalize(&item.name);
                if let Some(existing) = resolved.get_mut(&canonical) {
                    existing.upgrade_needs_wheels(item.needs_wheels);
                    continue;
                }
                if !in_flight.insert(canonical.clone()) {
                    continue;
                }
                survivors.push(item);
            }
            if survivors.is_empty() {
                break;
            }

            // Step 2: fetch_release for every survivor concurrently, bounded
            // by the resolver's own semaphore (spec.md §5: "resolver: ~10
            // slots").
            let mut fetches: FuturesUnordered<_> = survivors
                .into_iter()
                .map(|item| {
                    let semaphore = Arc::clone(&self.semaphore);
                    async move {
                        let _permit = semaphore.acquire().await.expect("semaphore is never closed");
                        let release = self
                            .client
                            .fetch_release(&item.name, item.pin.as_deref())
                            .await;
                        (item, release)
                    }
                })
                .collect();

            let mut newly_resolved: Vec<(String, bool)> = Vec::new();

            while let Some((item, release)) = fetches.next().await {
                let canonical = canonicalize(&item.name);
                in_flight.remove(&canonical);

                let Some(release) = release else {
                    warn!("dropping {canonical} from the closure: no metadata available");
                    continue;
                };

                resolved.insert(
                    canonical.clone(),
                    ResolvedPackage {
                        canonical_name: canonical.clone(),
                        version: release.version.clone(),
                        release: Some(release),
                        needs_wheels: item.needs_wheels,
                    },
                );
                newly_resolved.push((canonical, item.needs_wheels));
            }

            // Step 3 + 4: fetch_dependencies for every package reached this
            // round, then enqueue/upgrade children by marker reachability.
            let mut dep_fetches: FuturesUnordered<_> = newly_resolved
                .into_iter()
                .filter_map(|(canonical, needs_wheels)| {
                    let version = resolved.get(&canonical)?.version.clone();
                    Some((canonical, version, needs_wheels))
                })
                .map(|(canonical, version, needs_wheels)| {
                    let semaphore = Arc::clone(&self.semaphore);
                    async move {
                        let _permit = semaphore.acquire().await.expect("semaphore is never closed");
                        let deps = self
                            .client
                            .fetch_dependencies(&canonical, &version.to_string())
                            .await;
                        (deps, needs_wheels)
                    }
                })
                .collect();

            while let Some((deps, parent_needs_wheels)) = dep_fetches.next().await {
                for req in deps {
                    let reachable = self.reachable(&req);
                    let child_needs_wheels = parent_needs_wheels && reachable;
                    let name = req.name.to_string();
                    let canonical = canonicalize(&name);

                    if let Some(existing) = resolved.get_mut(&canonical) {
                        existing.upgrade_needs_wheels(child_needs_wheels);
                        continue;
                    }

                    frontier.push_back(FrontierItem {
                        name,
                        pin: pinned_version(&req),
                        needs_wheels: child_needs_wheels,
                    });
                }
            }
        }

        resolved
    }

    /// A dependency's marker is reachable if it evaluates true for at least
    /// one target, or if it has no marker at all. Evaluator exceptions
    /// (here: a target whose marker environment can't be constructed) are
    /// treated as reachable -- conservative inclusion, spec.md §4.3/§7.
    fn reachable(&self, req: &pep508_rs::Requirement) -> bool {
        let Some(marker) = req.marker.as_ref() else {
            return true;
        };

        self.targets.iter().any(|target| {
            match environment::marker_environment(target) {
                Some(env) => marker.evaluate(&env, &[]),
                None => true,
            }
        })
    }
}

/// Extract an `==`-pinned version from a requirement's specifier, if it
/// carries exactly that. Ranges and other operators are not back-tracked
/// over (spec.md §4.3/§9): the latest version is always preferred for them.
fn pinned_version(req: &pep508_rs::Requirement) -> Option<String> {
    let specifiers = req.version_or_url.as_ref()?.specifiers()?;
    let mut iter = specifiers.iter();
    let only = iter.next()?;
    if iter.next().is_some() {
        return None;
    }
    if *only.operator() == Operator::Equal {
        Some(only.version().to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotone_upgrade_never_downgrades() {
        let mut pkg = ResolvedPackage {
            canonical_name: "foo".to_string(),
            version: Version::from_str("1.0").unwrap(),
            release: None,
            needs_wheels: true,
        };
        pkg.upgrade_needs_wheels(false);
        assert!(pkg.needs_wheels());
        pkg.upgrade_needs_wheels(true);
        assert!(pkg.needs_wheels());
    }

    #[test]
    fn monotone_upgrade_turns_on() {
        let mut pkg = ResolvedPackage {
            canonical_name: "foo".to_string(),
            version: Version::from_str("1.0").unwrap(),
            release: None,
            needs_wheels: false,
        };
        pkg.upgrade_needs_wheels(true);
        assert!(pkg.needs_wheels());
    }

    #[test]
    fn pinned_version_extracts_equal() {
        let req = pep508_rs::Requirement::from_str("foo==1.2.3").unwrap();
        assert_eq!(pinned_version(&req).as_deref(), Some("1.2.3"));
    }

    #[test]
    fn pinned_version_ignores_ranges() {
        let req = pep508_rs::Requirement::from_str("foo>=1.2.3").unwrap();
        assert_eq!(pinned_version(&req), None);
    }
}
