use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use super::clock::Clock;
use super::error::{EngineError, Result};
use super::events::{EngineEvent, EventBus};
use super::generator::ResponseGenerator;
use super::health::{HealthMonitor, HealthReport};
use super::ledger::{Ledger, LedgerStats};
use super::model::{
    AiFollower, Circle, DispatchRecord, Interaction, InteractionType, Lab, LabStatus,
    PendingResponse, PendingStatus, Post, PostStatus,
};
use super::random::RandomSource;
use super::scheduler::{Dispatcher, SchedulerHandle, SchedulerSettings, TickReport};
use super::selector::CandidateSelector;
use super::store::Store;
use super::thread::{ThreadMaterializer, ThreadTree};

/// New content together with the responses it scheduled.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Published<T> {
    pub content: T,
    pub scheduled: Vec<PendingResponse>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabActivation {
    pub published: usize,
    pub scheduled: Vec<PendingResponse>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub followers: usize,
    pub active_followers: usize,
    #[serde(flatten)]
    pub ledger: LedgerStats,
}

/// Entry point for the surrounding application.
///
/// Content events run candidate selection synchronously and never touch the
/// generator; generation happens later on the dispatcher.
pub struct Engine {
    store: Store,
    ledger: Ledger,
    selector: CandidateSelector,
    materializer: ThreadMaterializer,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    health: Arc<HealthMonitor>,
}

impl Engine {
    pub fn new(
        store: Store,
        generator: Arc<dyn ResponseGenerator>,
        clock: Arc<dyn Clock>,
        rng: Arc<dyn RandomSource>,
        settings: SchedulerSettings,
    ) -> Self {
        let ledger = Ledger::new(store.clone());
        let events = EventBus::default();
        let poll_interval = chrono::Duration::from_std(settings.poll_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let health = Arc::new(HealthMonitor::new(poll_interval));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            generator,
            clock.clone(),
            events.clone(),
            health.clone(),
            settings,
        ));

        Self {
            selector: CandidateSelector::new(store.clone(), ledger.clone(), clock.clone(), rng),
            materializer: ThreadMaterializer::new(store.clone()),
            ledger,
            store,
            dispatcher,
            clock,
            events,
            health,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // Circles and followers

    pub fn create_circle(&self, owner_id: &str, name: &str) -> Result<Circle> {
        let circle = Circle::new(owner_id, name, self.clock.now());
        self.store.create_circle(&circle)?;
        info!(circle_id = %circle.id, owner_id, "circle created");
        Ok(circle)
    }

    pub fn create_follower(&self, follower: AiFollower) -> Result<AiFollower> {
        self.store.create_follower(&follower)?;
        info!(
            follower_id = %follower.id,
            user_id = %follower.user_id,
            responsiveness = %follower.responsiveness,
            "follower created"
        );
        Ok(follower)
    }

    pub fn add_follower_to_circle(&self, circle_id: &str, follower_id: &str) -> Result<()> {
        self.store.get_circle(circle_id)?;
        self.store.get_follower(follower_id)?;
        self.store.add_member(circle_id, follower_id)
    }

    pub fn remove_follower_from_circle(&self, circle_id: &str, follower_id: &str) -> Result<bool> {
        self.store.remove_member(circle_id, follower_id)
    }

    pub fn set_follower_active(&self, follower_id: &str, active: bool) -> Result<()> {
        self.store.set_follower_active(follower_id, active)
    }

    // Content events

    pub fn publish_post(
        &self,
        user_id: &str,
        circle_id: Option<&str>,
        content: &str,
    ) -> Result<Published<Post>> {
        if let Some(circle_id) = circle_id {
            self.store.get_circle(circle_id)?;
        }
        let post = Post::new(user_id, circle_id.map(str::to_string), content, self.clock.now());
        self.store.create_post(&post)?;
        info!(post_id = %post.id, user_id, "post published");

        let scheduled = self.select(&post, None);
        Ok(Published {
            content: post,
            scheduled,
        })
    }

    /// Human comment, or a reply when `parent_id` is given.
    pub fn add_comment(
        &self,
        post_id: &str,
        user_id: &str,
        content: &str,
        parent_id: Option<&str>,
    ) -> Result<Published<Interaction>> {
        let post = self.store.get_post(post_id)?;
        let interaction = self.materializer.record_human(
            post_id,
            user_id,
            InteractionType::Comment,
            Some(content.to_string()),
            parent_id.map(str::to_string),
            self.clock.now(),
        )?;

        let scheduled = self.select(&post, Some(&interaction));
        Ok(Published {
            content: interaction,
            scheduled,
        })
    }

    /// Human like. Likes never schedule responses.
    pub fn add_like(&self, post_id: &str, user_id: &str) -> Result<Interaction> {
        self.materializer.record_human(
            post_id,
            user_id,
            InteractionType::Like,
            None,
            None,
            self.clock.now(),
        )
    }

    /// Publish a single draft immediately and run selection for it.
    /// Whoever flips the draft first schedules; a post that was already
    /// published comes back with nothing scheduled.
    pub fn post_now(&self, post_id: &str) -> Result<Published<Post>> {
        let published = self.store.publish_draft(post_id)?;
        let post = self.store.get_post(post_id)?;
        let scheduled = if published {
            info!(post_id, "draft published early");
            self.select(&post, None)
        } else {
            Vec::new()
        };
        Ok(Published {
            content: post,
            scheduled,
        })
    }

    fn select(&self, post: &Post, trigger: Option<&Interaction>) -> Vec<PendingResponse> {
        match self.selector.on_new_content(post, trigger) {
            Ok(scheduled) => {
                for pending in &scheduled {
                    self.events.emit(EngineEvent::PendingCreated {
                        pending: pending.clone(),
                    });
                }
                scheduled
            }
            Err(e) => {
                warn!(post_id = %post.id, error = %e, "candidate selection failed");
                Vec::new()
            }
        }
    }

    // Deletion

    /// Delete a post, cancelling its still-pending responses first.
    pub fn delete_post(&self, post_id: &str) -> Result<Vec<PendingResponse>> {
        let cancelled = self.cancel_pending(post_id)?;
        self.store.delete_post(post_id)?;
        info!(post_id, cancelled = cancelled.len(), "post deleted");
        Ok(cancelled)
    }

    /// Delete an interaction and its replies, cancelling responses they triggered.
    pub fn delete_interaction(&self, interaction_id: &str) -> Result<Vec<PendingResponse>> {
        let interaction = self.store.get_interaction(interaction_id)?;
        let tree = self.materializer.tree_for_post(&interaction.post_id)?;
        let cancelled = self
            .ledger
            .cancel_for_triggers(&tree.subtree_ids(interaction_id))?;
        self.emit_cancelled(&cancelled);

        let removed = self.materializer.delete_interaction(interaction_id)?;
        info!(
            interaction_id,
            removed = removed.len(),
            cancelled = cancelled.len(),
            "interaction deleted"
        );
        Ok(cancelled)
    }

    /// Cancel every still-pending response for a post.
    pub fn cancel_pending(&self, post_id: &str) -> Result<Vec<PendingResponse>> {
        let cancelled = self.ledger.cancel_for_post(post_id)?;
        self.emit_cancelled(&cancelled);
        Ok(cancelled)
    }

    fn emit_cancelled(&self, cancelled: &[PendingResponse]) {
        for pending in cancelled {
            self.events.emit(EngineEvent::PendingCancelled {
                pending_id: pending.id.clone(),
                post_id: pending.post_id.clone(),
            });
        }
    }

    // Labs

    pub fn create_lab(&self, user_id: &str, name: &str) -> Result<Lab> {
        let lab = Lab::new(user_id, name, self.clock.now());
        self.store.create_lab(&lab)?;
        Ok(lab)
    }

    pub fn add_lab_draft(
        &self,
        lab_id: &str,
        circle_id: Option<&str>,
        content: &str,
    ) -> Result<Post> {
        let lab = self.store.get_lab(lab_id)?;
        if lab.status == LabStatus::Completed {
            return Err(EngineError::InvalidConfiguration(format!(
                "lab {} is already completed",
                lab_id
            )));
        }
        let draft = Post::draft(
            &lab.id,
            &lab.user_id,
            circle_id.map(str::to_string),
            content,
            self.clock.now(),
        );
        self.store.create_post(&draft)?;
        Ok(draft)
    }

    /// Publish every draft of a lab in one burst and schedule responses for each.
    pub fn activate_lab(&self, lab_id: &str) -> Result<LabActivation> {
        self.store.get_lab(lab_id)?;
        let mut activation = LabActivation::default();

        for draft in self.store.posts_for_lab(lab_id)? {
            if draft.status != PostStatus::Pending || !self.store.publish_draft(&draft.id)? {
                continue;
            }
            activation.published += 1;
            let post = Post {
                status: PostStatus::Posted,
                ..draft
            };
            activation.scheduled.extend(self.select(&post, None));
        }

        self.store.set_lab_status(lab_id, LabStatus::Active)?;
        info!(
            lab_id,
            published = activation.published,
            scheduled = activation.scheduled.len(),
            "lab activated"
        );
        Ok(activation)
    }

    /// Mark posts whose responses have all resolved as completed, and the lab
    /// once every post is.
    pub fn settle_lab(&self, lab_id: &str) -> Result<LabStatus> {
        let lab = self.store.get_lab(lab_id)?;
        if lab.status == LabStatus::Draft {
            return Ok(lab.status);
        }

        let mut open = 0;
        for post in self.store.posts_for_lab(lab_id)? {
            match post.status {
                PostStatus::Completed => {}
                PostStatus::Pending => open += 1,
                PostStatus::Posted => {
                    if self.ledger.unresolved_count(&post.id)? == 0 {
                        self.store.set_post_status(&post.id, PostStatus::Completed)?;
                    } else {
                        open += 1;
                    }
                }
            }
        }

        if open == 0 {
            self.store.set_lab_status(lab_id, LabStatus::Completed)?;
            return Ok(LabStatus::Completed);
        }
        Ok(LabStatus::Active)
    }

    // Read paths

    pub fn list_pending_for_post(&self, post_id: &str) -> Result<Vec<PendingResponse>> {
        self.ledger.list_by_post(post_id)
    }

    pub fn list_interactions_for_post(&self, post_id: &str) -> Result<ThreadTree> {
        self.store.get_post(post_id)?;
        self.materializer.tree_for_post(post_id)
    }

    pub fn history_for_post(&self, post_id: &str) -> Result<Vec<DispatchRecord>> {
        self.ledger.history_for_post(post_id)
    }

    pub fn failed_responses(&self) -> Result<Vec<PendingResponse>> {
        self.ledger.list_by_status(PendingStatus::Failed)
    }

    pub fn stats(&self) -> Result<EngineStats> {
        let followers = self.store.list_followers(None)?;
        Ok(EngineStats {
            active_followers: followers.iter().filter(|f| f.active).count(),
            followers: followers.len(),
            ledger: self.ledger.stats()?,
        })
    }

    pub fn health(&self) -> HealthReport {
        let store_ok = match self.store.ping() {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "store ping failed");
                false
            }
        };
        self.health.report(self.clock.now(), store_ok)
    }

    // Scheduling

    pub async fn tick(&self) -> Result<TickReport> {
        self.dispatcher.tick().await
    }

    pub fn start(&self) -> SchedulerHandle {
        self.dispatcher.start()
    }
}
