use anyhow::{Context, Result};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;

use crate::ai_provider::LlmGenerator;
use crate::config::Config;
use crate::core::{
    AiFollower, Engine, EngineEvent, HealthStatus, PendingResponse, PendingStatus, RandomSource,
    StdRandom, Store, SystemClock,
};

pub use commands::{
    Args, CircleCommands, Commands, DeleteCommands, FollowerCommands, LabCommands, PostCommands,
};

mod commands;

/// Load config, open the database and wire the engine with the configured provider.
pub fn open_engine(
    data_dir: Option<PathBuf>,
    provider: Option<String>,
    model: Option<String>,
) -> Result<Engine> {
    let config = Config::new(data_dir)?;
    let store = Store::new(config.database_path())
        .with_context(|| format!("Failed to open {}", config.database_path().display()))?;
    let ai_config = config.get_ai_config(provider, model)?;
    let generator = Arc::new(LlmGenerator::new(ai_config, store.clone())?);
    let rng: Arc<dyn RandomSource> = match config.seed {
        Some(seed) => Arc::new(StdRandom::seeded(seed)),
        None => Arc::new(StdRandom::new()),
    };

    Ok(Engine::new(
        store,
        generator,
        Arc::new(SystemClock),
        rng,
        config.scheduler.settings(),
    ))
}

pub async fn run(args: Args) -> Result<()> {
    let engine = open_engine(args.data_dir, args.provider, args.model)?;

    match args.command {
        Commands::Circle { command } => handle_circle(&engine, command),
        Commands::Follower { command } => handle_follower(&engine, command),
        Commands::Post { command } => handle_post(&engine, command),
        Commands::Comment {
            post,
            user,
            content,
            parent,
        } => handle_comment(&engine, &post, &user, &content, parent.as_deref()),
        Commands::Like { post, user } => {
            let like = engine.add_like(&post, &user)?;
            println!("{} {}", "Liked".green(), like.id);
            Ok(())
        }
        Commands::Lab { command } => handle_lab(&engine, command),
        Commands::Delete { command } => handle_delete(&engine, command),
        Commands::Pending { post } => handle_pending(&engine, &post),
        Commands::Thread { post, json } => handle_thread(&engine, &post, json),
        Commands::Cancel { post } => {
            let cancelled = engine.cancel_pending(&post)?;
            println!("Cancelled {} pending response(s)", cancelled.len());
            Ok(())
        }
        Commands::Tick => handle_tick(&engine).await,
        Commands::Run => handle_run(&engine).await,
        Commands::Health => handle_health(&engine),
        Commands::Stats => handle_stats(&engine),
    }
}

fn handle_circle(engine: &Engine, command: CircleCommands) -> Result<()> {
    match command {
        CircleCommands::Create { owner, name } => {
            let circle = engine.create_circle(&owner, &name)?;
            println!("{} {} ({})", "Circle created:".green(), circle.name, circle.id);
        }
        CircleCommands::Add { circle, follower } => {
            engine.add_follower_to_circle(&circle, &follower)?;
            println!("Added {} to {}", follower, circle);
        }
        CircleCommands::Remove { circle, follower } => {
            if engine.remove_follower_from_circle(&circle, &follower)? {
                println!("Removed {} from {}", follower, circle);
            } else {
                println!("{}", "Follower was not a member".yellow());
            }
        }
        CircleCommands::Roster { circle } => {
            let roster = engine.store().circle_roster(&circle)?;
            print_followers(&roster);
        }
    }
    Ok(())
}

fn handle_follower(engine: &Engine, command: FollowerCommands) -> Result<()> {
    match command {
        FollowerCommands::Create {
            user,
            name,
            personality,
            responsiveness,
            chance,
            delay_min,
            delay_max,
            interests,
            background,
            style,
        } => {
            let mut follower = AiFollower::new(
                user,
                name,
                personality,
                responsiveness,
                chance,
                chrono::Utc::now(),
            );
            if let (Some(min), Some(max)) = (delay_min, delay_max) {
                follower = follower.with_delay(min, max);
            }
            follower.interests = interests;
            follower.background = background;
            follower.communication_style = style;

            let follower = engine.create_follower(follower)?;
            println!("{} {} ({})", "Follower created:".green(), follower.name, follower.id);
        }
        FollowerCommands::List { user } => {
            let followers = engine.store().list_followers(user.as_deref())?;
            print_followers(&followers);
        }
        FollowerCommands::Activate { id } => {
            engine.set_follower_active(&id, true)?;
            println!("Follower {} activated", id);
        }
        FollowerCommands::Deactivate { id } => {
            engine.set_follower_active(&id, false)?;
            println!("Follower {} deactivated", id);
        }
    }
    Ok(())
}

fn print_followers(followers: &[AiFollower]) {
    if followers.is_empty() {
        println!("No followers found.");
        return;
    }

    println!("{} ({}):", "Followers".cyan().bold(), followers.len());
    for f in followers {
        let state = if f.active { "active".green() } else { "inactive".red() };
        println!(
            "  {} {} [{}] chance {}% {}",
            f.id.dimmed(),
            f.name.bold(),
            f.responsiveness,
            f.response_chance,
            state
        );
    }
}

fn print_scheduled(scheduled: &[PendingResponse]) {
    if scheduled.is_empty() {
        println!("No followers will respond.");
        return;
    }
    println!("{} follower(s) will respond soon:", scheduled.len());
    for pending in scheduled {
        println!(
            "  {} at {}",
            pending.follower_id,
            pending.scheduled_for.format("%Y-%m-%d %H:%M")
        );
    }
}

fn handle_post(engine: &Engine, command: PostCommands) -> Result<()> {
    let published = match command {
        PostCommands::Create {
            user,
            circle,
            content,
        } => engine.publish_post(&user, circle.as_deref(), &content)?,
        PostCommands::Now { id } => engine.post_now(&id)?,
    };
    println!("{} {}", "Post published:".green(), published.content.id);
    print_scheduled(&published.scheduled);
    Ok(())
}

fn handle_comment(
    engine: &Engine,
    post: &str,
    user: &str,
    content: &str,
    parent: Option<&str>,
) -> Result<()> {
    let published = engine.add_comment(post, user, content, parent)?;
    println!(
        "{} {} ({})",
        "Recorded".green(),
        published.content.interaction_type.as_str(),
        published.content.id
    );
    print_scheduled(&published.scheduled);
    Ok(())
}

fn handle_lab(engine: &Engine, command: LabCommands) -> Result<()> {
    match command {
        LabCommands::Create { user, name } => {
            let lab = engine.create_lab(&user, &name)?;
            println!("{} {} ({})", "Lab created:".green(), lab.name, lab.id);
        }
        LabCommands::Draft {
            lab,
            circle,
            content,
        } => {
            let draft = engine.add_lab_draft(&lab, circle.as_deref(), &content)?;
            println!("Draft {} added to lab {}", draft.id, lab);
        }
        LabCommands::Activate { id } => {
            let activation = engine.activate_lab(&id)?;
            println!(
                "{} published {} post(s), scheduled {} response(s)",
                "Lab activated:".green(),
                activation.published,
                activation.scheduled.len()
            );
        }
        LabCommands::Settle { id } => {
            let status = engine.settle_lab(&id)?;
            println!("Lab {} is {:?}", id, status);
        }
    }
    Ok(())
}

fn handle_delete(engine: &Engine, command: DeleteCommands) -> Result<()> {
    let (what, cancelled) = match command {
        DeleteCommands::Post { id } => ("post", engine.delete_post(&id)?),
        DeleteCommands::Interaction { id } => ("interaction", engine.delete_interaction(&id)?),
    };
    println!(
        "Deleted {}, cancelled {} pending response(s)",
        what,
        cancelled.len()
    );
    Ok(())
}

fn handle_pending(engine: &Engine, post: &str) -> Result<()> {
    let rows = engine.list_pending_for_post(post)?;
    if rows.is_empty() {
        println!("Nothing scheduled for {}.", post);
        return Ok(());
    }

    println!("{} for {}:", "Pending responses".cyan().bold(), post);
    for row in rows {
        let status = match row.status {
            PendingStatus::Pending => row.status.to_string().yellow(),
            PendingStatus::Dispatched => row.status.to_string().blue(),
            PendingStatus::Failed => row.status.to_string().red(),
        };
        println!(
            "  {} {} due {} attempts {}",
            row.follower_id,
            status,
            row.scheduled_for.format("%Y-%m-%d %H:%M:%S"),
            row.attempts
        );
        if let Some(error) = row.last_error {
            println!("    {}", error.dimmed());
        }
    }
    Ok(())
}

fn handle_thread(engine: &Engine, post: &str, json: bool) -> Result<()> {
    let tree = engine.list_interactions_for_post(post)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&tree.nested())?);
        return Ok(());
    }
    if tree.is_empty() {
        println!("No interactions yet.");
        return Ok(());
    }

    for entry in tree.walk() {
        let i = entry.interaction;
        let who = if i.author.is_ai() {
            format!("ai:{}", i.author.id()).magenta()
        } else {
            format!("user:{}", i.author.id()).normal()
        };
        println!(
            "{}{} {} {} {}",
            "  ".repeat(entry.depth),
            i.id.dimmed(),
            who,
            i.interaction_type.as_str(),
            i.content.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn handle_tick(engine: &Engine) -> Result<()> {
    let report = engine.tick().await?;
    println!(
        "due {}  materialized {}  skipped {}  retried {}  failed {}",
        report.due, report.materialized, report.skipped, report.retried, report.failed
    );
    Ok(())
}

async fn handle_run(engine: &Engine) -> Result<()> {
    let mut events = engine.events().subscribe();
    let handle = engine.start();
    println!("{}", "Scheduler running, press Ctrl-C to stop".cyan());

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                break;
            }
            event = events.recv() => match event {
                Ok(EngineEvent::ResponseMaterialized { interaction, .. }) => {
                    println!(
                        "{} {} on {}",
                        "+".green(),
                        interaction.interaction_type.as_str(),
                        interaction.post_id
                    );
                }
                Ok(EngineEvent::ResponseFailed { pending_id, reason, .. }) => {
                    println!("{} {} {}", "x".red(), pending_id, reason);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    handle.stop().await;
    Ok(())
}

fn handle_health(engine: &Engine) -> Result<()> {
    let report = engine.health();
    let paint = |status: HealthStatus| match status {
        HealthStatus::Ok => status.to_string().green(),
        HealthStatus::Degraded => status.to_string().red(),
    };
    println!("responseScheduler: {}", paint(report.response_scheduler));
    println!("threadManager: {}", paint(report.thread_manager));
    if let Some(error) = report.last_error {
        println!("last error: {}", error);
    }
    Ok(())
}

fn handle_stats(engine: &Engine) -> Result<()> {
    let stats = engine.stats()?;
    println!("{}", "CircleTube Stats".cyan().bold());
    println!("Followers: {} ({} active)", stats.followers, stats.active_followers);
    println!("Pending: {}", stats.ledger.pending);
    println!("In flight: {}", stats.ledger.dispatched);
    println!("Failed: {}", stats.ledger.failed);
    println!("Materialized: {}", stats.ledger.materialized);
    println!("Skipped: {}", stats.ledger.skipped);
    println!("Other finished: {}", stats.ledger.other_finished);
    Ok(())
}
