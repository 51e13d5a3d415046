use std::sync::Arc;
use tracing::{debug, warn};

use super::clock::Clock;
use super::error::{EngineError, Result};
use super::ledger::Ledger;
use super::model::{AiFollower, Interaction, InteractionType, PendingResponse, Post, PostStatus};
use super::random::RandomSource;
use super::responsiveness::compute_delay;
use super::store::Store;

/// Decides which followers react to a new post or comment and schedules them.
#[derive(Clone)]
pub struct CandidateSelector {
    store: Store,
    ledger: Ledger,
    clock: Arc<dyn Clock>,
    rng: Arc<dyn RandomSource>,
}

impl CandidateSelector {
    pub fn new(
        store: Store,
        ledger: Ledger,
        clock: Arc<dyn Clock>,
        rng: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            store,
            ledger,
            clock,
            rng,
        }
    }

    /// Followers allowed to react to `post`, optionally narrowed by the interaction
    /// that triggered selection.
    ///
    /// Only human comments, and human replies to AI comments, fan out. A reply
    /// to an AI comment addresses that follower alone.
    pub fn eligible_followers(
        &self,
        post: &Post,
        trigger: Option<&Interaction>,
    ) -> Result<Vec<AiFollower>> {
        if post.status == PostStatus::Pending {
            return Ok(Vec::new());
        }

        let mut addressed: Option<String> = None;
        if let Some(trigger) = trigger {
            if trigger.author.is_ai() || trigger.interaction_type == InteractionType::Like {
                return Ok(Vec::new());
            }
            if let Some(parent_id) = trigger.parent_id.as_deref() {
                let parent = self.store.get_interaction(parent_id)?;
                match parent.author.follower_id() {
                    Some(follower_id) => addressed = Some(follower_id.to_string()),
                    None => return Ok(Vec::new()),
                }
            }
        }

        let roster = match post.circle_id.as_deref() {
            Some(circle_id) => self.store.circle_roster(circle_id)?,
            None => self.store.list_followers(Some(&post.user_id))?,
        };
        let trigger_author = trigger.and_then(|t| t.author.follower_id());

        Ok(roster
            .into_iter()
            .filter(|f| f.active)
            .filter(|f| Some(f.id.as_str()) != trigger_author)
            .filter(|f| addressed.as_deref().map_or(true, |a| a == f.id))
            .collect())
    }

    /// Roll each eligible follower's response chance and schedule the winners.
    ///
    /// Per-follower problems are logged and skipped so one bad configuration
    /// never blocks the rest of the roster.
    pub fn on_new_content(
        &self,
        post: &Post,
        trigger: Option<&Interaction>,
    ) -> Result<Vec<PendingResponse>> {
        let now = self.clock.now();
        let trigger_id = trigger.map(|t| t.id.as_str());
        let mut scheduled = Vec::new();

        for follower in self.eligible_followers(post, trigger)? {
            if !self.rng.chance(follower.response_chance) {
                debug!(post_id = %post.id, follower_id = %follower.id, "follower passed on content");
                continue;
            }

            let delay = match compute_delay(&follower, self.rng.as_ref()) {
                Ok(delay) => delay,
                Err(e) => {
                    warn!(follower_id = %follower.id, error = %e, "skipping misconfigured follower");
                    continue;
                }
            };

            match self
                .ledger
                .create(&post.id, &follower.id, trigger_id, now + delay, now)
            {
                Ok(pending) => {
                    debug!(
                        post_id = %post.id,
                        follower_id = %follower.id,
                        scheduled_for = %pending.scheduled_for,
                        "scheduled response"
                    );
                    scheduled.push(pending);
                }
                Err(EngineError::DuplicateActive { .. }) => {
                    debug!(post_id = %post.id, follower_id = %follower.id, "response already scheduled");
                }
                Err(e) => {
                    warn!(post_id = %post.id, follower_id = %follower.id, error = %e, "failed to schedule response");
                }
            }
        }

        Ok(scheduled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::model::{Circle, Responsiveness};
    use crate::core::testing::ForcedRandom;
    use crate::core::thread::ThreadMaterializer;
    use chrono::{Duration, Utc};
    use std::thread;

    struct Fixture {
        store: Store,
        ledger: Ledger,
        selector: CandidateSelector,
        circle: Circle,
    }

    fn fixture(rng: Arc<dyn RandomSource>) -> Fixture {
        let store = Store::open_in_memory().unwrap();
        let ledger = Ledger::new(store.clone());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let circle = Circle::new("owner", "friends", Utc::now());
        store.create_circle(&circle).unwrap();
        Fixture {
            selector: CandidateSelector::new(store.clone(), ledger.clone(), clock, rng),
            store,
            ledger,
            circle,
        }
    }

    fn member(f: &Fixture, name: &str, chance: u8) -> AiFollower {
        let follower =
            AiFollower::new("owner", name, "friendly", Responsiveness::Instant, chance, Utc::now());
        f.store.create_follower(&follower).unwrap();
        f.store.add_member(&f.circle.id, &follower.id).unwrap();
        follower
    }

    fn post(f: &Fixture) -> Post {
        let post = Post::new("owner", Some(f.circle.id.clone()), "sunset pics", Utc::now());
        f.store.create_post(&post).unwrap();
        post
    }

    #[test]
    fn test_chance_gates_scheduling() {
        let f = fixture(Arc::new(crate::core::random::StdRandom::seeded(3)));
        let always = member(&f, "F1", 100);
        member(&f, "F2", 0);
        let post = post(&f);

        let scheduled = f.selector.on_new_content(&post, None).unwrap();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].follower_id, always.id);
        assert!(scheduled[0].scheduled_for - scheduled[0].created_at <= Duration::minutes(5));
    }

    #[test]
    fn test_inactive_and_non_members_are_ignored() {
        let f = fixture(Arc::new(ForcedRandom::always()));
        let active = member(&f, "A", 100);
        let sleeper = member(&f, "B", 100);
        f.store.set_follower_active(&sleeper.id, false).unwrap();
        let outsider = AiFollower::new("owner", "C", "", Responsiveness::Instant, 100, Utc::now());
        f.store.create_follower(&outsider).unwrap();

        let post = post(&f);
        let ids: Vec<String> = f
            .selector
            .eligible_followers(&post, None)
            .unwrap()
            .into_iter()
            .map(|x| x.id)
            .collect();
        assert_eq!(ids, vec![active.id]);
    }

    #[test]
    fn test_circleless_post_reaches_all_author_followers() {
        let f = fixture(Arc::new(ForcedRandom::always()));
        member(&f, "A", 100);
        let other_user = AiFollower::new("someone-else", "Z", "", Responsiveness::Zen, 100, Utc::now());
        f.store.create_follower(&other_user).unwrap();
        let loose = AiFollower::new("owner", "L", "", Responsiveness::Active, 100, Utc::now());
        f.store.create_follower(&loose).unwrap();

        let post = Post::new("owner", None, "open post", Utc::now());
        f.store.create_post(&post).unwrap();
        assert_eq!(f.selector.on_new_content(&post, None).unwrap().len(), 2);
    }

    #[test]
    fn test_reply_to_ai_comment_addresses_that_follower() {
        let f = fixture(Arc::new(ForcedRandom::always()));
        let a = member(&f, "A", 100);
        member(&f, "B", 100);
        let post = post(&f);
        let materializer = ThreadMaterializer::new(f.store.clone());

        let pending = f.ledger.create(&post.id, &a.id, None, Utc::now(), Utc::now()).unwrap();
        f.ledger.claim(&pending.id, Utc::now()).unwrap();
        let pending = f.ledger.get(&pending.id).unwrap().unwrap();
        let ai_comment = materializer
            .commit(
                &pending,
                &crate::core::generator::Decision::Comment {
                    content: "nice colors".into(),
                },
                Utc::now(),
            )
            .unwrap()
            .interaction()
            .cloned()
            .unwrap();

        let human_reply = materializer
            .record_human(
                &post.id,
                "owner",
                InteractionType::Reply,
                Some("thanks!".into()),
                Some(ai_comment.id.clone()),
                Utc::now(),
            )
            .unwrap();
        let scheduled = f.selector.on_new_content(&post, Some(&human_reply)).unwrap();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].follower_id, a.id);
        assert_eq!(scheduled[0].trigger_id.as_deref(), Some(human_reply.id.as_str()));

        // AI-authored content never fans out.
        assert!(f.selector.on_new_content(&post, Some(&ai_comment)).unwrap().is_empty());
    }

    #[test]
    fn test_reply_between_humans_triggers_nobody() {
        let f = fixture(Arc::new(ForcedRandom::always()));
        member(&f, "A", 100);
        let post = post(&f);
        let materializer = ThreadMaterializer::new(f.store.clone());

        let comment = materializer
            .record_human(
                &post.id,
                "friend",
                InteractionType::Comment,
                Some("where was this?".into()),
                None,
                Utc::now(),
            )
            .unwrap();
        let reply = materializer
            .record_human(
                &post.id,
                "owner",
                InteractionType::Reply,
                Some("Lisbon".into()),
                Some(comment.id.clone()),
                Utc::now(),
            )
            .unwrap();

        assert!(f.selector.eligible_followers(&post, Some(&reply)).unwrap().is_empty());
        assert!(f.selector.on_new_content(&post, Some(&reply)).unwrap().is_empty());
        // The top-level human comment itself still fans out.
        assert_eq!(f.selector.on_new_content(&post, Some(&comment)).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_rolls_schedule_nothing() {
        let f = fixture(Arc::new(ForcedRandom::never()));
        member(&f, "A", 100);
        member(&f, "B", 100);
        let post = post(&f);

        assert_eq!(f.selector.eligible_followers(&post, None).unwrap().len(), 2);
        assert!(f.selector.on_new_content(&post, None).unwrap().is_empty());
        assert!(f.ledger.list_by_post(&post.id).unwrap().is_empty());
    }

    #[test]
    fn test_draft_posts_are_not_scheduled() {
        let f = fixture(Arc::new(ForcedRandom::always()));
        member(&f, "A", 100);
        let draft = Post::draft("lab", "owner", Some(f.circle.id.clone()), "later", Utc::now());
        assert!(f.selector.on_new_content(&draft, None).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_triggers_create_one_row_per_pair() {
        let f = fixture(Arc::new(ForcedRandom::always()));
        for name in ["A", "B", "C"] {
            member(&f, name, 100);
        }
        let post = post(&f);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let selector = f.selector.clone();
                let post = post.clone();
                thread::spawn(move || selector.on_new_content(&post, None).unwrap().len())
            })
            .collect();
        let created: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(created, 3);
        assert_eq!(f.ledger.list_by_post(&post.id).unwrap().len(), 3);
    }
}
