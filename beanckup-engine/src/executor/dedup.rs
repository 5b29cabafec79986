//! Content sharing across runs.
//!
//! A deduplicated file has no copy of its own at the destination. The
//! manifest's `deduplicated` metadata links it to the path whose copy holds
//! its content. Packaging writes in place, so a holder can only serve as
//! such while its copy exists and the current run does not overwrite it.

use crate::diff::DiffOutcome;
use crate::fs::walker::absolute_path;
use crate::manifest::{FileStatus, Manifest};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use tracing::debug;

/// How the current run shares content with what the destination holds
#[derive(Debug, Default)]
pub struct DedupPlan {
    /// Content hash → path whose copy survives this run
    pub index: BTreeMap<String, String>,

    /// Unchanged files that keep their link, path → holder
    pub carried: BTreeMap<String, String>,

    /// Unchanged files whose holder is gone or is rewritten by this run
    pub rematerialize: Vec<String>,
}

/// Links recorded in a manifest, each resolved to the end of its chain.
/// A link caught in a cycle resolves to a path that is itself linked.
pub fn resolved_links(manifest: &Manifest) -> BTreeMap<String, String> {
    let raw = manifest.deduplicated_links();

    raw.iter()
        .map(|(path, holder)| {
            let mut holder = holder;
            let mut hops = 0;
            while let Some(next) = raw.get(holder) {
                hops += 1;
                if hops > raw.len() {
                    break;
                }
                holder = next;
            }
            (path.clone(), holder.clone())
        })
        .collect()
}

/// Decide which prior copies may back this run's files.
///
/// `with_index` controls whether new files may be deduplicated at all;
/// links recorded by earlier runs are honoured either way.
pub async fn plan(
    prior: Option<&Manifest>,
    outcome: &DiffOutcome,
    package_root: &Path,
    with_index: bool,
) -> DedupPlan {
    let mut plan = DedupPlan::default();
    let Some(prior) = prior else {
        return plan;
    };

    let links = resolved_links(prior);
    let rewritten: HashSet<&str> = outcome
        .files_to_package()
        .map(|file| file.path.as_str())
        .collect();
    let mut copies = CopyProbe::new(package_root);

    for (path, holder) in &links {
        let unchanged = outcome
            .files
            .get(path)
            .is_some_and(|file| file.status == FileStatus::Unchanged);
        if !unchanged {
            continue;
        }

        let usable = !links.contains_key(holder)
            && !rewritten.contains(holder.as_str())
            && copies.exists(holder).await;
        if usable {
            plan.carried.insert(path.clone(), holder.clone());
        } else {
            debug!("{} lost its holder {}, copying it again", path, holder);
            plan.rematerialize.push(path.clone());
        }
    }

    if with_index {
        for (path, file) in &prior.files {
            if !file.has_hash() || links.contains_key(path) || rewritten.contains(path.as_str()) {
                continue;
            }
            if copies.exists(path).await {
                plan.index.insert(file.content_hash.clone(), path.clone());
            }
        }
    }

    plan
}

/// Memoized existence checks against the package root
struct CopyProbe<'a> {
    root: &'a Path,
    seen: HashMap<String, bool>,
}

impl<'a> CopyProbe<'a> {
    fn new(root: &'a Path) -> Self {
        Self {
            root,
            seen: HashMap::new(),
        }
    }

    async fn exists(&mut self, path: &str) -> bool {
        if let Some(&known) = self.seen.get(path) {
            return known;
        }
        let found = tokio::fs::metadata(absolute_path(self.root, path))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        self.seen.insert(path.to_string(), found);
        found
    }
}
