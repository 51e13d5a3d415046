use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode};
use serde::Serialize;
use std::collections::HashMap;

use super::error::{EngineError, Result};
use super::generator::Decision;
use super::ledger;
use super::model::{Author, DispatchOutcome, Interaction, InteractionType, PendingResponse, PendingStatus};
use super::store::{get_interaction_in, get_post_in, interactions_for_post_in, ts, Store};

/// Interactions of one post, indexed by id with parent links resolved.
///
/// Nodes live in a flat arena; every traversal is iterative so deep or
/// malformed threads cannot blow the stack.
#[derive(Debug, Clone, Default)]
pub struct ThreadTree {
    post_id: String,
    nodes: Vec<Interaction>,
    index: HashMap<String, usize>,
    children: Vec<Vec<usize>>,
    roots: Vec<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadEntry<'a> {
    pub depth: usize,
    #[serde(flatten)]
    pub interaction: &'a Interaction,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadNode {
    #[serde(flatten)]
    pub interaction: Interaction,
    pub replies: Vec<ThreadNode>,
}

impl ThreadTree {
    /// Build the tree. Rows from other posts are dropped; rows whose parent is
    /// missing from the set become roots.
    pub fn build(post_id: &str, interactions: Vec<Interaction>) -> Self {
        let nodes: Vec<Interaction> = interactions
            .into_iter()
            .filter(|i| i.post_id == post_id)
            .collect();
        let index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();

        let mut children = vec![Vec::new(); nodes.len()];
        let mut roots = Vec::new();
        for (i, node) in nodes.iter().enumerate() {
            match node.parent_id.as_ref().and_then(|p| index.get(p)) {
                Some(&parent) if parent != i => children[parent].push(i),
                _ => roots.push(i),
            }
        }

        Self {
            post_id: post_id.to_string(),
            nodes,
            index,
            children,
            roots,
        }
    }

    pub fn post_id(&self) -> &str {
        &self.post_id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Interaction> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn roots(&self) -> impl Iterator<Item = &Interaction> {
        self.roots.iter().map(move |&i| &self.nodes[i])
    }

    pub fn children(&self, id: &str) -> Vec<&Interaction> {
        self.index
            .get(id)
            .map(|&i| self.children[i].iter().map(|&c| &self.nodes[c]).collect())
            .unwrap_or_default()
    }

    /// Pre-order walk with depth, children in insertion order.
    /// Nodes caught in a parent cycle are never reached from a root and are skipped.
    pub fn walk(&self) -> Vec<ThreadEntry<'_>> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut visited = vec![false; self.nodes.len()];
        let mut stack: Vec<(usize, usize)> = self.roots.iter().rev().map(|&r| (r, 0)).collect();

        while let Some((i, depth)) = stack.pop() {
            if std::mem::replace(&mut visited[i], true) {
                continue;
            }
            out.push(ThreadEntry {
                depth,
                interaction: &self.nodes[i],
            });
            for &c in self.children[i].iter().rev() {
                stack.push((c, depth + 1));
            }
        }
        out
    }

    /// Parent chain of `id`, nearest first. Stops at a root or on a cycle.
    pub fn ancestors(&self, id: &str) -> Vec<&Interaction> {
        let mut chain = Vec::new();
        let Some(mut current) = self.get(id) else {
            return chain;
        };
        while let Some(parent) = current.parent_id.as_deref().and_then(|p| self.get(p)) {
            if chain.len() > self.nodes.len() {
                break;
            }
            chain.push(parent);
            current = parent;
        }
        chain
    }

    /// Ids of `id` and everything below it.
    pub fn subtree_ids(&self, id: &str) -> Vec<String> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![start];
        while let Some(i) = stack.pop() {
            if std::mem::replace(&mut visited[i], true) {
                continue;
            }
            out.push(self.nodes[i].id.clone());
            stack.extend(self.children[i].iter().copied());
        }
        out
    }

    /// Nested view for API consumers, assembled bottom-up without recursion.
    pub fn nested(&self) -> Vec<ThreadNode> {
        let order = self.walk();
        let mut built: Vec<Option<ThreadNode>> = vec![None; self.nodes.len()];

        for entry in order.iter().rev() {
            let i = self.index[&entry.interaction.id];
            let replies = self.children[i]
                .iter()
                .filter_map(|&c| built[c].take())
                .collect();
            built[i] = Some(ThreadNode {
                interaction: self.nodes[i].clone(),
                replies,
            });
        }

        self.roots.iter().filter_map(|&r| built[r].take()).collect()
    }

    pub fn count_of(&self, kind: InteractionType) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.interaction_type == kind)
            .count()
    }
}

/// What happened to a committed decision.
#[derive(Debug, Clone)]
pub enum Commit {
    Materialized(Interaction),
    Skipped,
    /// The pending row or the post vanished while the response was in flight.
    Orphaned,
}

impl Commit {
    pub fn interaction(&self) -> Option<&Interaction> {
        match self {
            Commit::Materialized(i) => Some(i),
            _ => None,
        }
    }
}

fn insert_interaction_in(conn: &Connection, interaction: &Interaction) -> Result<()> {
    let result = conn.execute(
        "INSERT INTO interactions (id, post_id, author_kind, author_id, type, content, parent_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            &interaction.id,
            &interaction.post_id,
            interaction.author.kind(),
            interaction.author.id(),
            interaction.interaction_type.as_str(),
            &interaction.content,
            &interaction.parent_id,
            ts(&interaction.created_at),
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == ErrorCode::ConstraintViolation
                && interaction.interaction_type == InteractionType::Like =>
        {
            Err(EngineError::DuplicateLike {
                post_id: interaction.post_id.clone(),
                follower_id: interaction.author.id().to_string(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// The parent must exist and belong to the same post.
fn check_thread_target(conn: &Connection, post_id: &str, parent_id: &str) -> Result<()> {
    match get_interaction_in(conn, parent_id)? {
        Some(parent) if parent.post_id == post_id => Ok(()),
        _ => Err(EngineError::InvalidThreadTarget {
            post_id: post_id.to_string(),
            target_id: parent_id.to_string(),
        }),
    }
}

/// Sole writer of interaction rows.
#[derive(Clone)]
pub struct ThreadMaterializer {
    store: Store,
}

impl ThreadMaterializer {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn tree_for_post(&self, post_id: &str) -> Result<ThreadTree> {
        let interactions = self.store.interactions_for_post(post_id)?;
        Ok(ThreadTree::build(post_id, interactions))
    }

    /// Write the decision for a claimed pending response and finalize the
    /// ledger row in the same transaction.
    ///
    /// The interaction insert happens before the ledger row is archived, so a
    /// crash in between leaves the row in place for the reaper to retry.
    pub fn commit(
        &self,
        pending: &PendingResponse,
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> Result<Commit> {
        self.store.with_tx(|conn| {
            let claimed = ledger::get_in(conn, &pending.id)?
                .map(|row| row.status == PendingStatus::Dispatched)
                .unwrap_or(false);
            if !claimed || get_post_in(conn, &pending.post_id)?.is_none() {
                return Ok(Commit::Orphaned);
            }

            let author = Author::Ai {
                follower_id: pending.follower_id.clone(),
            };
            let interaction = match decision {
                Decision::Skip => None,
                Decision::Like => Some(Interaction::new(
                    &pending.post_id,
                    author,
                    InteractionType::Like,
                    None,
                    None,
                    now,
                )),
                Decision::Comment { content } => Some(Interaction::new(
                    &pending.post_id,
                    author,
                    InteractionType::Comment,
                    Some(content.clone()),
                    None,
                    now,
                )),
                Decision::Reply { parent_id, content } => {
                    check_thread_target(conn, &pending.post_id, parent_id)?;
                    Some(Interaction::new(
                        &pending.post_id,
                        author,
                        InteractionType::Reply,
                        Some(content.clone()),
                        Some(parent_id.clone()),
                        now,
                    ))
                }
            };

            match interaction {
                Some(interaction) => {
                    insert_interaction_in(conn, &interaction)?;
                    ledger::mark_dispatched_in(
                        conn,
                        &pending.id,
                        DispatchOutcome::Materialized,
                        Some(&interaction.id),
                        now,
                    )?;
                    Ok(Commit::Materialized(interaction))
                }
                None => {
                    ledger::mark_dispatched_in(conn, &pending.id, DispatchOutcome::Skipped, None, now)?;
                    Ok(Commit::Skipped)
                }
            }
        })
    }

    /// Record an interaction written by a person.
    pub fn record_human(
        &self,
        post_id: &str,
        user_id: &str,
        kind: InteractionType,
        content: Option<String>,
        parent_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Interaction> {
        let kind = match (kind, &parent_id) {
            (InteractionType::Comment, Some(_)) => InteractionType::Reply,
            (InteractionType::Reply, None) => InteractionType::Comment,
            (k, _) => k,
        };
        if kind != InteractionType::Like && content.as_deref().map_or(true, |c| c.trim().is_empty()) {
            return Err(EngineError::Parse(format!("{} requires content", kind.as_str())));
        }

        self.store.with_tx(|conn| {
            if get_post_in(conn, post_id)?.is_none() {
                return Err(EngineError::NotFound(format!("post {}", post_id)));
            }
            if let Some(parent) = parent_id.as_deref() {
                check_thread_target(conn, post_id, parent)?;
            }

            let interaction = Interaction::new(
                post_id,
                Author::Human {
                    user_id: user_id.to_string(),
                },
                kind,
                content,
                parent_id,
                now,
            );
            insert_interaction_in(conn, &interaction)?;
            Ok(interaction)
        })
    }

    /// Delete an interaction and its replies. Returns the ids removed.
    pub fn delete_interaction(&self, id: &str) -> Result<Vec<String>> {
        self.store.with_tx(|conn| {
            let interaction = get_interaction_in(conn, id)?
                .ok_or_else(|| EngineError::NotFound(format!("interaction {}", id)))?;
            let tree = ThreadTree::build(
                &interaction.post_id,
                interactions_for_post_in(conn, &interaction.post_id)?,
            );
            let removed = tree.subtree_ids(id);
            conn.execute("DELETE FROM interactions WHERE id = ?1", params![id])?;
            Ok(removed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ledger::Ledger;
    use crate::core::model::{AiFollower, Post, Responsiveness};

    fn interaction(id: &str, post: &str, parent: Option<&str>) -> Interaction {
        Interaction {
            id: id.to_string(),
            post_id: post.to_string(),
            author: Author::Human {
                user_id: "u".to_string(),
            },
            interaction_type: if parent.is_some() {
                InteractionType::Reply
            } else {
                InteractionType::Comment
            },
            content: Some(id.to_string()),
            parent_id: parent.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_walk_is_preorder_with_depth() {
        let tree = ThreadTree::build(
            "p",
            vec![
                interaction("a", "p", None),
                interaction("b", "p", None),
                interaction("a1", "p", Some("a")),
                interaction("a1x", "p", Some("a1")),
                interaction("other", "q", None),
            ],
        );
        let order: Vec<(&str, usize)> = tree
            .walk()
            .iter()
            .map(|e| (e.interaction.id.as_str(), e.depth))
            .collect();
        assert_eq!(order, vec![("a", 0), ("a1", 1), ("a1x", 2), ("b", 0)]);
        assert!(!tree.contains("other"));
    }

    #[test]
    fn test_deep_thread_does_not_recurse() {
        let mut rows = vec![interaction("n0", "p", None)];
        for i in 1..20_000 {
            rows.push(interaction(&format!("n{}", i), "p", Some(&format!("n{}", i - 1))));
        }
        let tree = ThreadTree::build("p", rows);
        assert_eq!(tree.walk().len(), 20_000);
        assert_eq!(tree.ancestors("n19999").len(), 19_999);
        assert_eq!(tree.subtree_ids("n19990").len(), 10);
    }

    #[test]
    fn test_cycle_is_not_followed_forever() {
        let tree = ThreadTree::build(
            "p",
            vec![
                interaction("root", "p", None),
                interaction("x", "p", Some("y")),
                interaction("y", "p", Some("x")),
            ],
        );
        assert_eq!(tree.walk().len(), 1);
        assert!(tree.ancestors("x").len() <= tree.len() + 1);
    }

    #[test]
    fn test_nested_matches_walk() {
        let tree = ThreadTree::build(
            "p",
            vec![
                interaction("a", "p", None),
                interaction("a1", "p", Some("a")),
                interaction("a2", "p", Some("a")),
            ],
        );
        let nested = tree.nested();
        assert_eq!(nested.len(), 1);
        assert_eq!(nested[0].replies.len(), 2);
        assert_eq!(nested[0].replies[1].interaction.id, "a2");
    }

    struct Fixture {
        store: Store,
        ledger: Ledger,
        materializer: ThreadMaterializer,
        post: Post,
        follower: AiFollower,
    }

    fn fixture() -> Fixture {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let post = Post::new("u1", None, "what are you reading?", now);
        store.create_post(&post).unwrap();
        let follower = AiFollower::new("u1", "Ava", "bookish", Responsiveness::Instant, 100, now);
        store.create_follower(&follower).unwrap();
        Fixture {
            ledger: Ledger::new(store.clone()),
            materializer: ThreadMaterializer::new(store.clone()),
            store,
            post,
            follower,
        }
    }

    fn claimed(f: &Fixture) -> PendingResponse {
        let now = Utc::now();
        let row = f.ledger.create(&f.post.id, &f.follower.id, None, now, now).unwrap();
        assert!(f.ledger.claim(&row.id, now).unwrap());
        f.ledger.get(&row.id).unwrap().unwrap()
    }

    #[test]
    fn test_reply_chain_terminates_at_root_on_same_post() {
        let f = fixture();
        let human = f
            .materializer
            .record_human(&f.post.id, "u2", InteractionType::Comment, Some("Dune".into()), None, Utc::now())
            .unwrap();

        let pending = claimed(&f);
        let decision = Decision::Reply {
            parent_id: human.id.clone(),
            content: "Great pick".to_string(),
        };
        let commit = f.materializer.commit(&pending, &decision, Utc::now()).unwrap();
        let reply = commit.interaction().unwrap().clone();
        assert_eq!(reply.parent_id.as_deref(), Some(human.id.as_str()));

        let tree = f.materializer.tree_for_post(&f.post.id).unwrap();
        let chain = tree.ancestors(&reply.id);
        let root = chain.last().unwrap();
        assert!(root.parent_id.is_none());
        assert!(chain.iter().all(|i| i.post_id == f.post.id));
        assert!(f.ledger.list_by_post(&f.post.id).unwrap().is_empty());
    }

    #[test]
    fn test_reply_to_foreign_post_is_invalid_and_leaves_row() {
        let f = fixture();
        let other = Post::new("u1", None, "elsewhere", Utc::now());
        f.store.create_post(&other).unwrap();
        let foreign = f
            .materializer
            .record_human(&other.id, "u2", InteractionType::Comment, Some("hi".into()), None, Utc::now())
            .unwrap();

        let pending = claimed(&f);
        let decision = Decision::Reply {
            parent_id: foreign.id,
            content: "hello".to_string(),
        };
        let err = f.materializer.commit(&pending, &decision, Utc::now()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidThreadTarget { .. }));
        assert_eq!(f.store.count_interactions(&f.post.id).unwrap(), 0);
        assert_eq!(f.ledger.list_by_post(&f.post.id).unwrap().len(), 1);
    }

    #[test]
    fn test_second_like_is_rejected() {
        let f = fixture();
        let first = claimed(&f);
        f.materializer.commit(&first, &Decision::Like, Utc::now()).unwrap();

        let second = claimed(&f);
        let err = f.materializer.commit(&second, &Decision::Like, Utc::now()).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateLike { .. }));
        assert_eq!(f.store.count_interactions(&f.post.id).unwrap(), 1);
    }

    #[test]
    fn test_skip_clears_row_without_interaction() {
        let f = fixture();
        let pending = claimed(&f);
        let commit = f.materializer.commit(&pending, &Decision::Skip, Utc::now()).unwrap();
        assert!(matches!(commit, Commit::Skipped));
        assert_eq!(f.store.count_interactions(&f.post.id).unwrap(), 0);
        assert!(f.ledger.list_by_post(&f.post.id).unwrap().is_empty());
        let history = f.ledger.history_for_post(&f.post.id).unwrap();
        assert_eq!(history[0].outcome, DispatchOutcome::Skipped);
    }

    #[test]
    fn test_commit_on_deleted_post_is_orphaned() {
        let f = fixture();
        let pending = claimed(&f);
        f.store.delete_post(&f.post.id).unwrap();
        let commit = f
            .materializer
            .commit(&pending, &Decision::Comment { content: "late".into() }, Utc::now())
            .unwrap();
        assert!(matches!(commit, Commit::Orphaned));
    }

    #[test]
    fn test_delete_interaction_returns_subtree() {
        let f = fixture();
        let top = f
            .materializer
            .record_human(&f.post.id, "u2", InteractionType::Comment, Some("top".into()), None, Utc::now())
            .unwrap();
        let child = f
            .materializer
            .record_human(
                &f.post.id,
                "u3",
                InteractionType::Comment,
                Some("child".into()),
                Some(top.id.clone()),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(child.interaction_type, InteractionType::Reply);

        let mut removed = f.materializer.delete_interaction(&top.id).unwrap();
        removed.sort();
        let mut expected = vec![top.id, child.id];
        expected.sort();
        assert_eq!(removed, expected);
        assert_eq!(f.store.count_interactions(&f.post.id).unwrap(), 0);
    }
}
