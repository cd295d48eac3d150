//! Mount tree composition.
//!
//! Layer mounts that share a destination, or that land inside another layer
//! mount, are merged into one node per distinct destination. Every node
//! carries the full, index-ordered list of host directories that make up its
//! view, including the subdirectories of layers mounted higher up.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use strata_common::{StrataError, StrataResult};
use strata_oci::Mount;

use super::{MountSpec, normalize_destination};

/// A host directory contributing to a layered node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSource {
    /// Host path of the directory.
    pub path: PathBuf,
    /// Index of the layer it came from; higher indexes sit on top.
    pub index: usize,
    /// Destination the layer itself was mounted at.
    pub origin: PathBuf,
}

/// What a node mounts at its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeContent {
    /// Directories merged into one view, sorted by ascending index.
    Layers(Vec<LayerSource>),
    /// A mount passed through untouched.
    Raw(Mount),
}

/// One destination in the tree.
#[derive(Debug, Clone)]
pub struct MountNode {
    destination: PathBuf,
    content: NodeContent,
    children: Vec<MountNode>,
}

impl MountNode {
    fn layered(destination: PathBuf, sources: Vec<LayerSource>) -> Self {
        Self {
            destination,
            content: NodeContent::Layers(sources),
            children: Vec::new(),
        }
    }

    /// Destination inside the container.
    #[must_use]
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// What this node mounts.
    #[must_use]
    pub const fn content(&self) -> &NodeContent {
        &self.content
    }

    /// Nodes mounted directly beneath this one.
    #[must_use]
    pub fn children(&self) -> &[Self] {
        &self.children
    }

    /// Layer sources, bottom-most first. Empty for raw nodes.
    #[must_use]
    pub fn sources(&self) -> &[LayerSource] {
        match &self.content {
            NodeContent::Layers(sources) => sources,
            NodeContent::Raw(_) => &[],
        }
    }

    /// The raw mount, if this node holds one.
    #[must_use]
    pub const fn raw(&self) -> Option<&Mount> {
        match &self.content {
            NodeContent::Raw(mount) => Some(mount),
            NodeContent::Layers(_) => None,
        }
    }

    fn conflict(&self) -> StrataError {
        StrataError::MountConflict {
            destination: self.destination.clone(),
        }
    }

    fn add(&mut self, addition: Addition) -> StrataResult<()> {
        if self.raw().is_some() {
            return Err(self.conflict());
        }

        match addition {
            Addition::Raw(mount) => {
                if !self.sources().is_empty() {
                    return Err(self.conflict());
                }
                self.content = NodeContent::Raw(mount);
            }
            Addition::Layer(source) => {
                if let NodeContent::Layers(sources) = &mut self.content {
                    insert_sorted(sources, source.clone());
                }
                for child in &mut self.children {
                    child.propagate(&self.destination, &source);
                }
            }
        }
        Ok(())
    }

    /// Offer `source`, mounted at `origin`, to this node and its descendants.
    fn propagate(&mut self, origin: &Path, source: &LayerSource) {
        let NodeContent::Layers(sources) = &mut self.content else {
            return;
        };
        let Some(candidate) = descend(&source.path, origin, &self.destination) else {
            return;
        };

        insert_sorted(
            sources,
            LayerSource {
                path: candidate,
                index: source.index,
                origin: source.origin.clone(),
            },
        );
        for child in &mut self.children {
            child.propagate(origin, source);
        }
    }

    /// Sources of this node that also reach `destination`.
    fn inherited(&self, destination: &Path) -> Vec<LayerSource> {
        self.sources()
            .iter()
            .filter_map(|source| {
                descend(&source.path, &self.destination, destination).map(|path| LayerSource {
                    path,
                    index: source.index,
                    origin: source.origin.clone(),
                })
            })
            .collect()
    }

    /// Drop sources of layers mounted outside `boundary`, down to the next raw node.
    fn detach_from(&mut self, boundary: &Path) {
        let NodeContent::Layers(sources) = &mut self.content else {
            return;
        };
        sources.retain(|source| source.origin.starts_with(boundary));
        for child in &mut self.children {
            child.detach_from(boundary);
        }
    }

    /// Create a new child at `destination`, adopting existing children below it.
    fn spawn(&mut self, destination: &Path, addition: Addition) -> Self {
        let (nested, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.children)
            .into_iter()
            .partition(|child| child.destination.starts_with(destination));
        self.children = kept;

        match addition {
            Addition::Raw(mount) => {
                let mut children = nested;
                // Layers above a raw mount never show through it.
                for child in &mut children {
                    child.detach_from(destination);
                }
                Self {
                    destination: destination.to_path_buf(),
                    content: NodeContent::Raw(mount),
                    children,
                }
            }
            Addition::Layer(source) => {
                let mut sources = self.inherited(destination);
                insert_sorted(&mut sources, source.clone());

                let mut node = Self::layered(destination.to_path_buf(), sources);
                node.children = nested;
                for child in &mut node.children {
                    child.propagate(destination, &source);
                }
                node
            }
        }
    }
}

#[derive(Debug)]
enum Addition {
    Layer(LayerSource),
    Raw(Mount),
}

/// The composed mounts of one container.
///
/// The root node is always `/`; it starts as an empty layered node.
#[derive(Debug, Clone)]
pub struct MountTree {
    root: MountNode,
}

impl Default for MountTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MountTree {
    /// Create an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: MountNode::layered(PathBuf::from("/"), Vec::new()),
        }
    }

    /// Build a tree from a sequence of specs, inserted in order.
    ///
    /// # Errors
    ///
    /// Returns the first insertion failure.
    pub fn build(specs: impl IntoIterator<Item = MountSpec>) -> StrataResult<Self> {
        let mut tree = Self::new();
        for spec in specs {
            tree.insert(spec)?;
        }
        Ok(tree)
    }

    /// Insert one spec.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::InvalidMountPath`] for malformed destinations and
    /// [`StrataError::MountConflict`] when a raw mount would share a
    /// destination with anything else.
    pub fn insert(&mut self, spec: MountSpec) -> StrataResult<()> {
        let destination = normalize_destination(spec.destination())?;
        let addition = match spec {
            MountSpec::Layer(layer) => Addition::Layer(LayerSource {
                path: layer.effective_source(),
                index: layer.index,
                origin: destination.clone(),
            }),
            MountSpec::Raw(mut mount) => {
                mount.destination.clone_from(&destination);
                Addition::Raw(mount)
            }
        };

        tracing::trace!(destination = %destination.display(), ?addition, "Inserting mount");
        insert_at(&mut self.root, &destination, addition)
    }

    /// The `/` node.
    #[must_use]
    pub const fn root(&self) -> &MountNode {
        &self.root
    }

    /// Look up the node mounted exactly at `destination`.
    #[must_use]
    pub fn get(&self, destination: impl AsRef<Path>) -> Option<&MountNode> {
        let destination = normalize_destination(destination.as_ref()).ok()?;
        let mut node = &self.root;
        loop {
            if node.destination == destination {
                return Some(node);
            }
            node = node
                .children
                .iter()
                .find(|child| destination.starts_with(&child.destination))?;
        }
    }

    /// Walk the tree breadth-first, parents before children.
    pub fn iter(&self) -> impl Iterator<Item = &MountNode> {
        let mut queue = VecDeque::from([&self.root]);
        std::iter::from_fn(move || {
            let node = queue.pop_front()?;
            queue.extend(node.children.iter());
            Some(node)
        })
    }

    /// Number of nodes, the root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Returns true if nothing was inserted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty() && self.root.sources().is_empty() && self.root.raw().is_none()
    }
}

fn insert_at(node: &mut MountNode, destination: &Path, addition: Addition) -> StrataResult<()> {
    if node.destination == destination {
        return node.add(addition);
    }

    if let Some(child) = node
        .children
        .iter_mut()
        .find(|child| destination.starts_with(&child.destination))
    {
        return insert_at(child, destination, addition);
    }

    let child = node.spawn(destination, addition);
    node.children.push(child);
    Ok(())
}

/// `source` relocated from `origin` to `target`, if that path exists on disk.
fn descend(source: &Path, origin: &Path, target: &Path) -> Option<PathBuf> {
    let relative = target.strip_prefix(origin).ok()?;
    let candidate = source.join(relative);
    std::fs::symlink_metadata(&candidate).ok()?;
    Some(candidate)
}

/// Insert keeping ascending index order; equal indexes keep insertion order.
fn insert_sorted(sources: &mut Vec<LayerSource>, source: LayerSource) {
    if sources
        .iter()
        .any(|existing| existing.path == source.path && existing.index == source.index)
    {
        return;
    }
    let at = sources.partition_point(|existing| existing.index <= source.index);
    sources.insert(at, source);
}

#[cfg(test)]
mod tests {
    use std::fs;

    use proptest::prelude::*;
    use tempfile::TempDir;

    use super::*;
    use crate::mount::LayerMount;

    fn paths(node: &MountNode) -> Vec<PathBuf> {
        node.sources().iter().map(|s| s.path.clone()).collect()
    }

    fn store(dirs: &[&str]) -> TempDir {
        let tmp = tempfile::tempdir().unwrap();
        for dir in dirs {
            fs::create_dir_all(tmp.path().join(dir)).unwrap();
        }
        tmp
    }

    #[test]
    fn empty_tree_has_bare_root() {
        let tree = MountTree::new();
        assert!(tree.is_empty());
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.root().destination(), Path::new("/"));
        assert!(tree.root().sources().is_empty());
    }

    #[test]
    fn layers_at_same_destination_merge() {
        let mut tree = MountTree::new();
        tree.insert(MountSpec::layer(2, "/nonexistent/b", "/")).unwrap();
        tree.insert(MountSpec::layer(0, "/nonexistent/a", "/")).unwrap();
        tree.insert(MountSpec::layer(1, "/nonexistent/c", "/")).unwrap();

        assert_eq!(tree.len(), 1);
        assert_eq!(
            paths(tree.root()),
            vec![
                PathBuf::from("/nonexistent/a"),
                PathBuf::from("/nonexistent/c"),
                PathBuf::from("/nonexistent/b"),
            ]
        );
    }

    #[test]
    fn equal_indexes_keep_insertion_order() {
        let mut tree = MountTree::new();
        tree.insert(MountSpec::layer(1, "/nonexistent/first", "/")).unwrap();
        tree.insert(MountSpec::layer(1, "/nonexistent/second", "/")).unwrap();

        assert_eq!(
            paths(tree.root()),
            vec![
                PathBuf::from("/nonexistent/first"),
                PathBuf::from("/nonexistent/second"),
            ]
        );
    }

    #[test]
    fn raw_conflicts_with_layers() {
        let mut tree = MountTree::new();
        tree.insert(MountSpec::layer(0, "/nonexistent/a", "/data")).unwrap();
        let err = tree
            .insert(MountSpec::Raw(Mount::tmpfs("/data")))
            .unwrap_err();
        assert!(matches!(err, StrataError::MountConflict { .. }));

        let mut tree = MountTree::new();
        tree.insert(MountSpec::Raw(Mount::tmpfs("/tmp"))).unwrap();
        assert!(matches!(
            tree.insert(MountSpec::layer(0, "/nonexistent/a", "/tmp")),
            Err(StrataError::MountConflict { .. })
        ));
        assert!(matches!(
            tree.insert(MountSpec::Raw(Mount::tmpfs("/tmp/"))),
            Err(StrataError::MountConflict { .. })
        ));
    }

    #[test]
    fn raw_mount_may_own_empty_root() {
        let mut tree = MountTree::new();
        tree.insert(MountSpec::Raw(Mount::bind("/srv/rootfs", "/")))
            .unwrap();
        assert!(tree.root().raw().is_some());
        assert!(matches!(
            tree.insert(MountSpec::layer(0, "/nonexistent/a", "/")),
            Err(StrataError::MountConflict { .. })
        ));
    }

    #[test]
    fn raw_destination_is_normalized() {
        let mut tree = MountTree::new();
        tree.insert(MountSpec::Raw(Mount::tmpfs("/run/./user/")))
            .unwrap();
        let node = tree.get("/run/user").unwrap();
        assert_eq!(node.raw().unwrap().destination, PathBuf::from("/run/user"));
    }

    #[test]
    fn invalid_destination_rejected() {
        let mut tree = MountTree::new();
        assert!(matches!(
            tree.insert(MountSpec::layer(0, "/a", "relative")),
            Err(StrataError::InvalidMountPath { .. })
        ));
        assert!(matches!(
            tree.insert(MountSpec::layer(0, "/a", "/x/../y")),
            Err(StrataError::InvalidMountPath { .. })
        ));
        assert!(tree.is_empty());
    }

    #[test]
    fn new_node_adopts_deeper_children() {
        let mut tree = MountTree::new();
        tree.insert(MountSpec::Raw(Mount::tmpfs("/a/b/c"))).unwrap();
        tree.insert(MountSpec::Raw(Mount::tmpfs("/a/d"))).unwrap();
        tree.insert(MountSpec::Raw(Mount::tmpfs("/ab"))).unwrap();
        tree.insert(MountSpec::layer(0, "/nonexistent/a", "/a")).unwrap();

        let root_children: Vec<_> = tree
            .root()
            .children()
            .iter()
            .map(MountNode::destination)
            .collect();
        assert_eq!(root_children, vec![Path::new("/ab"), Path::new("/a")]);

        let a = tree.get("/a").unwrap();
        assert_eq!(a.children().len(), 2);
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn propagation_into_nested_layers() {
        // Scenario: A at / (index 0), B at /x (index 1), C at / (index 2).
        let a = store(&["x"]);
        let b = store(&[]);
        let c = store(&["x"]);

        let tree = MountTree::build([
            MountSpec::layer(0, a.path(), "/"),
            MountSpec::layer(1, b.path(), "/x"),
            MountSpec::layer(2, c.path(), "/"),
        ])
        .unwrap();

        assert_eq!(
            paths(tree.root()),
            vec![a.path().to_path_buf(), c.path().to_path_buf()]
        );
        let x = tree.get("/x").unwrap();
        assert_eq!(
            paths(x),
            vec![a.path().join("x"), b.path().to_path_buf(), c.path().join("x")]
        );
        assert_eq!(
            x.sources().iter().map(|s| s.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn missing_subdirectories_are_not_propagated() {
        let a = store(&[]);
        let b = store(&[]);

        let tree = MountTree::build([
            MountSpec::layer(0, a.path(), "/"),
            MountSpec::layer(1, b.path(), "/opt"),
        ])
        .unwrap();

        assert_eq!(paths(tree.get("/opt").unwrap()), vec![b.path().to_path_buf()]);
    }

    #[test]
    fn propagation_reaches_grandchildren() {
        let a = store(&["usr/lib"]);
        let b = store(&[]);
        let c = store(&[]);

        let tree = MountTree::build([
            MountSpec::layer(1, b.path(), "/usr"),
            MountSpec::layer(2, c.path(), "/usr/lib"),
            MountSpec::layer(0, a.path(), "/"),
        ])
        .unwrap();

        assert_eq!(
            paths(tree.get("/usr").unwrap()),
            vec![a.path().join("usr"), b.path().to_path_buf()]
        );
        assert_eq!(
            paths(tree.get("/usr/lib").unwrap()),
            vec![a.path().join("usr/lib"), c.path().to_path_buf()]
        );
    }

    #[test]
    fn propagation_stops_at_raw_mounts() {
        let a = store(&["proc/sys"]);
        let b = store(&[]);

        let tree = MountTree::build([
            MountSpec::Raw(Mount::proc("/proc")),
            MountSpec::layer(1, b.path(), "/proc/sys"),
            MountSpec::layer(0, a.path(), "/"),
        ])
        .unwrap();

        let sys = tree.get("/proc/sys").unwrap();
        assert_eq!(paths(sys), vec![b.path().to_path_buf()]);
    }

    #[test]
    fn raw_mount_hides_outer_layers_in_any_order() {
        let a = store(&["x/y"]);
        let b = store(&[]);
        let layer_a = || MountSpec::layer(0, a.path(), "/");
        let tmpfs = || MountSpec::Raw(Mount::tmpfs("/x"));
        let layer_b = || MountSpec::layer(1, b.path(), "/x/y");

        let orders = [
            vec![layer_a(), tmpfs(), layer_b()],
            vec![layer_a(), layer_b(), tmpfs()],
            vec![layer_b(), layer_a(), tmpfs()],
            vec![tmpfs(), layer_b(), layer_a()],
        ];
        for specs in orders {
            let tree = MountTree::build(specs).unwrap();
            assert_eq!(paths(tree.get("/x/y").unwrap()), vec![b.path().to_path_buf()]);
            assert_eq!(paths(tree.root()), vec![a.path().to_path_buf()]);
            assert!(tree.get("/x").unwrap().raw().is_some());
        }
    }

    #[test]
    fn sources_remember_their_origin() {
        let a = store(&["x"]);
        let b = store(&[]);
        let tree = MountTree::build([
            MountSpec::layer(1, b.path(), "/x"),
            MountSpec::layer(0, a.path(), "/"),
        ])
        .unwrap();

        let origins: Vec<_> = tree
            .get("/x")
            .unwrap()
            .sources()
            .iter()
            .map(|s| s.origin.clone())
            .collect();
        assert_eq!(origins, vec![PathBuf::from("/"), PathBuf::from("/x")]);
    }

    #[test]
    fn selector_source_is_used() {
        let pkg = store(&["share/data"]);
        let mut tree = MountTree::new();
        tree.insert(MountSpec::Layer(LayerMount {
            index: 0,
            source: pkg.path().to_path_buf(),
            destination: PathBuf::from("/data"),
            selector: Some(PathBuf::from("share/data")),
        }))
        .unwrap();

        assert_eq!(
            paths(tree.get("/data").unwrap()),
            vec![pkg.path().join("share/data")]
        );
    }

    #[test]
    fn iteration_is_breadth_first() {
        let tree = MountTree::build([
            MountSpec::Raw(Mount::tmpfs("/a/b")),
            MountSpec::layer(0, "/nonexistent/a", "/a"),
            MountSpec::Raw(Mount::tmpfs("/c")),
        ])
        .unwrap();

        let order: Vec<_> = tree.iter().map(|n| n.destination().to_path_buf()).collect();
        assert_eq!(
            order,
            vec![
                PathBuf::from("/"),
                PathBuf::from("/a"),
                PathBuf::from("/c"),
                PathBuf::from("/a/b"),
            ]
        );
    }

    const DESTINATIONS: &[&str] = &["/", "/a", "/a/b", "/a/b/c", "/d", "/a/e"];

    fn check_invariants(node: &MountNode) {
        let indexes: Vec<_> = node.sources().iter().map(|s| s.index).collect();
        let mut sorted = indexes.clone();
        sorted.sort_unstable();
        assert_eq!(indexes, sorted, "sources out of order at {:?}", node.destination());

        for child in node.children() {
            assert!(child.destination().starts_with(node.destination()));
            assert_ne!(child.destination(), node.destination());
            for sibling in node.children() {
                if sibling.destination() != child.destination() {
                    assert!(!sibling.destination().starts_with(child.destination()));
                }
            }
            check_invariants(child);
        }
    }

    proptest! {
        #[test]
        fn tree_invariants_hold(ops in prop::collection::vec((0..DESTINATIONS.len(), 0usize..4), 1..12)) {
            let tmp = store(&["l0/a/b/c", "l0/d", "l0/a/e", "l1/a/b", "l2/a", "l3"]);
            let mut tree = MountTree::new();

            for (dest, layer) in &ops {
                let source = tmp.path().join(format!("l{layer}"));
                tree.insert(MountSpec::layer(*layer, source, DESTINATIONS[*dest])).unwrap();
            }

            check_invariants(tree.root());

            let mut seen = std::collections::HashSet::new();
            for node in tree.iter() {
                prop_assert!(seen.insert(node.destination().to_path_buf()));
            }
            for (dest, _) in &ops {
                prop_assert!(tree.get(DESTINATIONS[*dest]).is_some());
            }
        }

        #[test]
        fn insertion_order_does_not_change_sources(mut layers in prop::collection::vec(0usize..4, 1..6)) {
            let tmp = store(&["l0/a", "l1/a", "l2/a", "l3/a"]);
            layers.sort_unstable();
            layers.dedup();

            let specs = |order: &[usize]| -> Vec<MountSpec> {
                order
                    .iter()
                    .map(|l| MountSpec::layer(*l, tmp.path().join(format!("l{l}")), "/"))
                    .chain(std::iter::once(MountSpec::layer(9, tmp.path().join("l0/a"), "/a")))
                    .collect()
            };

            let forward = MountTree::build(specs(&layers)).unwrap();
            let mut reversed_order = layers.clone();
            reversed_order.reverse();
            let reversed = MountTree::build(specs(&reversed_order)).unwrap();

            prop_assert_eq!(
                paths(forward.get("/a").unwrap()),
                paths(reversed.get("/a").unwrap())
            );
        }
    }
}
