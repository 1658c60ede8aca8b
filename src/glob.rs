//! prefix-merged glob pattern tree and its evaluator.
//!
//! patterns share nodes for common prefixes; evaluation walks the hybrid
//! inode graph doing the minimum tree loading: a lazy stub subtree is
//! matched against its backing tree through the object store instead of
//! being promoted to an inode.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::inodes::{Inode, MountCore, TreeInode};
use crate::stats::bump;
use crate::types::{EntryKind, Tree};

/// one matched entry, relative to the evaluation root
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct GlobResult {
    pub path: String,
    pub kind: EntryKind,
}

/// caller-supplied sink for source hashes the evaluator predicts will
/// be fetched soon
pub type PrefetchList = Mutex<Vec<Hash>>;

#[derive(Clone, Debug)]
enum Token {
    /// the parse root; matches nothing itself
    Root,
    /// plain component, compared byte-wise (dotfiles always match)
    Literal(String),
    /// single-component wildcard with `*`, `?` or character classes
    Pattern { source: String, pattern: glob::Pattern },
    /// `**`, matching zero or more components
    Recursive,
}

impl Token {
    fn parse(component: &str, pattern: &str) -> Result<Self> {
        if component == "**" {
            return Ok(Token::Recursive);
        }
        if component
            .chars()
            .any(|c| matches!(c, '*' | '?' | '[' | ']'))
        {
            let compiled = glob::Pattern::new(component).map_err(|e| Error::InvalidGlob {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;
            return Ok(Token::Pattern {
                source: component.to_string(),
                pattern: compiled,
            });
        }
        Ok(Token::Literal(component.to_string()))
    }

    fn source(&self) -> &str {
        match self {
            Token::Root => "",
            Token::Literal(s) => s,
            Token::Pattern { source, .. } => source,
            Token::Recursive => "**",
        }
    }
}

/// a node of the shared pattern tree
pub struct GlobNode {
    token: Token,
    include_dotfiles: bool,
    /// a pattern ends at this node; matches here are emitted
    is_leaf: bool,
    children: Vec<GlobNode>,
}

impl GlobNode {
    pub fn new_root(include_dotfiles: bool) -> Self {
        Self {
            token: Token::Root,
            include_dotfiles,
            is_leaf: false,
            children: Vec::new(),
        }
    }

    /// add one pattern to the tree, sharing existing prefix nodes
    pub fn parse(&mut self, pattern: &str) -> Result<()> {
        let components: Vec<&str> = pattern.split('/').filter(|c| !c.is_empty()).collect();
        if components.is_empty() {
            return Err(Error::InvalidGlob {
                pattern: pattern.to_string(),
                message: "pattern has no components".to_string(),
            });
        }

        let include_dotfiles = self.include_dotfiles;
        let mut node = self;
        let last = components.len() - 1;
        for (i, component) in components.into_iter().enumerate() {
            let pos = node
                .children
                .iter()
                .position(|c| c.token.source() == component);
            let idx = match pos {
                Some(idx) => idx,
                None => {
                    node.children.push(GlobNode {
                        token: Token::parse(component, pattern)?,
                        include_dotfiles,
                        is_leaf: false,
                        children: Vec::new(),
                    });
                    node.children.len() - 1
                }
            };
            node = &mut node.children[idx];
            if i == last {
                node.is_leaf = true;
            }
        }
        Ok(())
    }

    /// evaluate every parsed pattern against the tree rooted at `root`
    ///
    /// results are deduplicated by path and returned sorted. when a
    /// prefetch sink is given, matched file entries that still carry a
    /// source hash are appended to it.
    pub fn evaluate(
        &self,
        core: &MountCore,
        root: &Arc<TreeInode>,
        prefetch: Option<&PrefetchList>,
    ) -> Result<Vec<GlobResult>> {
        bump(&core.stats.glob.evaluations);
        let mut evaluator = Evaluator {
            core,
            prefetch,
            results: BTreeMap::new(),
        };
        let top: Vec<&GlobNode> = self.children.iter().collect();
        evaluator.walk_inode(&top, "", root)?;
        Ok(evaluator
            .results
            .into_iter()
            .map(|(path, kind)| GlobResult { path, kind })
            .collect())
    }

    fn matches(&self, name: &str) -> bool {
        match &self.token {
            Token::Root => false,
            Token::Literal(literal) => literal == name,
            Token::Pattern { pattern, .. } => pattern.matches_with(
                name,
                glob::MatchOptions {
                    case_sensitive: true,
                    require_literal_separator: true,
                    require_literal_leading_dot: !self.include_dotfiles,
                },
            ),
            Token::Recursive => self.include_dotfiles || !name.starts_with('.'),
        }
    }
}

/// listing row fed to the matcher, from either a live directory or a
/// backing tree
struct EntryView {
    name: String,
    kind: EntryKind,
    hash: Option<Hash>,
    inode: Option<Inode>,
}

struct Evaluator<'a> {
    core: &'a MountCore,
    prefetch: Option<&'a PrefetchList>,
    results: BTreeMap<String, EntryKind>,
}

impl Evaluator<'_> {
    fn walk_inode<'g>(
        &mut self,
        nodes: &[&'g GlobNode],
        prefix: &str,
        dir: &Arc<TreeInode>,
    ) -> Result<()> {
        let active = expand(nodes);
        for child in dir.children_for_glob(self.core)? {
            let view = EntryView {
                name: child.name,
                kind: child.kind,
                hash: child.hash,
                inode: child.inode,
            };
            self.visit(&active, prefix, &view, Some(dir))?;
        }
        Ok(())
    }

    fn walk_source_tree<'g>(
        &mut self,
        nodes: &[&'g GlobNode],
        prefix: &str,
        tree: &Tree,
    ) -> Result<()> {
        let active = expand(nodes);
        for entry in tree.entries() {
            let view = EntryView {
                name: entry.name.clone(),
                kind: entry.kind,
                hash: Some(entry.hash),
                inode: None,
            };
            self.visit(&active, prefix, &view, None)?;
        }
        Ok(())
    }

    fn visit<'g>(
        &mut self,
        active: &[&'g GlobNode],
        prefix: &str,
        entry: &EntryView,
        parent: Option<&Arc<TreeInode>>,
    ) -> Result<()> {
        for &node in active {
            if !node.matches(&entry.name) {
                continue;
            }
            if node.is_leaf {
                self.emit(prefix, entry);
            }
            if !entry.kind.is_tree() {
                continue;
            }
            let next: Vec<&'g GlobNode> = match node.token {
                // `**` stays in scope at every depth; its children come
                // back in through expansion at the next level
                Token::Recursive => vec![node],
                _ => node.children.iter().collect(),
            };
            if !next.is_empty() {
                self.descend(&next, prefix, entry, parent)?;
            }
        }
        Ok(())
    }

    fn descend<'g>(
        &mut self,
        nodes: &[&'g GlobNode],
        prefix: &str,
        entry: &EntryView,
        parent: Option<&Arc<TreeInode>>,
    ) -> Result<()> {
        let path = join(prefix, &entry.name);
        match &entry.inode {
            Some(Inode::Tree(tree)) => self.walk_inode(nodes, &path, tree),
            Some(Inode::File(_)) => Ok(()),
            None => match entry.hash {
                // still a lazy stub: match against the backing tree
                // instead of promoting it to an inode
                Some(hash) => {
                    let tree = self.core.store.get_tree(&hash)?;
                    self.walk_source_tree(nodes, &path, &tree)
                }
                // materialized but unloaded: local overlay data, cheap
                // to promote through the parent
                None => {
                    let parent = parent.ok_or_else(|| Error::InvariantViolation {
                        ino: 0,
                        message: format!("source tree entry {path} has no hash"),
                    })?;
                    match parent.lookup(self.core, &entry.name)? {
                        Inode::Tree(tree) => self.walk_inode(nodes, &path, &tree),
                        Inode::File(_) => Ok(()),
                    }
                }
            },
        }
    }

    fn emit(&mut self, prefix: &str, entry: &EntryView) {
        let path = join(prefix, &entry.name);
        if self.results.contains_key(&path) {
            return;
        }
        self.results.insert(path, entry.kind);

        // only file entries that still reside in a backing tree are
        // prefetch candidates; overlay-native and materialized entries
        // carry no source hash
        if entry.kind.is_tree() {
            return;
        }
        if let (Some(sink), Some(hash)) = (self.prefetch, entry.hash) {
            sink.lock().push(hash);
        }
    }
}

/// close the active set over `**` nodes: a recursive token matches zero
/// components, so its children are in scope at the same level
fn expand<'g>(nodes: &[&'g GlobNode]) -> Vec<&'g GlobNode> {
    let mut out: Vec<&'g GlobNode> = Vec::new();
    let mut queue: Vec<&'g GlobNode> = nodes.to_vec();
    while let Some(node) = queue.pop() {
        if out.iter().any(|seen| std::ptr::eq(*seen, node)) {
            continue;
        }
        if matches!(node.token, Token::Recursive) {
            for child in &node.children {
                queue.push(child);
            }
        }
        out.push(node);
    }
    // keep deterministic pattern order for visitation
    out.reverse();
    out
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}
