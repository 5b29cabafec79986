//! Status-annotated file tree for reviewing a prepared backup.

use crate::manifest::{DirInfo, FileInfo, FileStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// One node of the review tree. Directories carry children and no status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub name: String,
    pub path: String,
    pub is_dir: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<FileStatus>,

    /// Per-path problem attached during diffing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    fn file(info: &FileInfo) -> Self {
        Self {
            name: info.name.clone(),
            path: info.path.clone(),
            is_dir: false,
            status: Some(info.status),
            error: info.error.clone(),
            children: Vec::new(),
        }
    }

    /// Look up a descendant (or self) by relative path
    pub fn find(&self, path: &str) -> Option<&TreeNode> {
        if self.path == path {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(path))
    }

    /// Number of file leaves beneath this node
    pub fn file_count(&self) -> usize {
        if self.is_dir {
            self.children.iter().map(TreeNode::file_count).sum()
        } else {
            1
        }
    }
}

/// Find a node by path anywhere in a forest
pub fn find<'a>(forest: &'a [TreeNode], path: &str) -> Option<&'a TreeNode> {
    forest.iter().find_map(|node| node.find(path))
}

#[derive(Default)]
struct DirBuilder<'a> {
    dirs: BTreeMap<&'a str, DirBuilder<'a>>,
    files: BTreeMap<&'a str, &'a FileInfo>,
}

impl<'a> DirBuilder<'a> {
    fn dir_mut(&mut self, path: &'a str) -> &mut DirBuilder<'a> {
        path.split('/')
            .filter(|part| !part.is_empty())
            .fold(self, |node, part| node.dirs.entry(part).or_default())
    }

    fn into_nodes(self, prefix: &str) -> Vec<TreeNode> {
        let mut nodes = Vec::with_capacity(self.dirs.len() + self.files.len());

        for (name, dir) in self.dirs {
            let path = join(prefix, name);
            let children = dir.into_nodes(&path);
            nodes.push(TreeNode {
                name: name.to_string(),
                path,
                is_dir: true,
                status: None,
                error: None,
                children,
            });
        }

        nodes.extend(self.files.into_values().map(TreeNode::file));
        nodes
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Build the review forest beneath an episode root.
///
/// Directories come before files at every level, each group ordered by
/// exact byte-wise name. Directories named only by a file's parent path are
/// created implicitly, which keeps deleted files from vanished directories
/// visible. The current scan owns every name it reports: a deleted file is
/// hidden when a current directory shares its path, or when one of its
/// ancestors is now a current file.
pub fn build_tree<'a, F, D>(files: F, directories: D) -> Vec<TreeNode>
where
    F: IntoIterator<Item = &'a FileInfo>,
    D: IntoIterator<Item = &'a DirInfo>,
{
    let files: Vec<&FileInfo> = files.into_iter().collect();
    let current_files: HashSet<&str> = files
        .iter()
        .filter(|file| file.status != FileStatus::Deleted)
        .map(|file| file.path.as_str())
        .collect();

    let mut root = DirBuilder::default();

    for dir in directories {
        root.dir_mut(&dir.path);
    }

    let mut pending = Vec::new();
    for file in files {
        if file.status == FileStatus::Deleted {
            if let Some(owner) = ancestors(&file.path).find(|a| current_files.contains(a)) {
                debug!("{} is now a file, hiding deleted {}", owner, file.path);
                continue;
            }
        }

        let (parent, name) = match file.path.rsplit_once('/') {
            Some((parent, name)) => (parent, name),
            None => ("", file.path.as_str()),
        };
        root.dir_mut(parent);
        pending.push((parent, name, file));
    }

    for (parent, name, file) in pending {
        let dir = root.dir_mut(parent);
        if dir.dirs.contains_key(name) {
            debug!("{} is now a directory, hiding its {} file entry", file.path, file.status);
            continue;
        }
        dir.files.insert(name, file);
    }

    root.into_nodes("")
}

/// Proper ancestors of a relative key, nearest to the root first
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').map(move |(i, _)| &path[..i])
}
