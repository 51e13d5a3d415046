use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::core::Responsiveness;

#[derive(Parser)]
#[command(name = "circletube")]
#[command(about = "AI follower response scheduling and threading engine")]
#[command(version)]
pub struct Args {
    /// Data directory holding config.json and the database
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,
    /// Generative provider (ollama, openai)
    #[arg(long, global = true)]
    pub provider: Option<String>,
    /// Model name override
    #[arg(long, global = true)]
    pub model: Option<String>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage circles and their follower rosters
    Circle {
        #[command(subcommand)]
        command: CircleCommands,
    },
    /// Manage AI followers
    Follower {
        #[command(subcommand)]
        command: FollowerCommands,
    },
    /// Publish posts
    Post {
        #[command(subcommand)]
        command: PostCommands,
    },
    /// Comment on a post, or reply to an existing comment
    Comment {
        #[arg(long)]
        post: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        content: String,
        /// Interaction id to reply to
        #[arg(long)]
        parent: Option<String>,
    },
    /// Like a post
    Like {
        #[arg(long)]
        post: String,
        #[arg(long)]
        user: String,
    },
    /// Labs: batches of drafts published in one burst
    Lab {
        #[command(subcommand)]
        command: LabCommands,
    },
    /// Delete a post or an interaction, cancelling responses waiting on it
    Delete {
        #[command(subcommand)]
        command: DeleteCommands,
    },
    /// Show scheduled, in-flight and failed responses for a post
    Pending {
        post: String,
    },
    /// Show the interaction thread of a post
    Thread {
        post: String,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Cancel every still-pending response for a post
    Cancel {
        post: String,
    },
    /// Run one dispatch pass now
    Tick,
    /// Run the scheduler until interrupted
    Run,
    /// Show component health
    Health,
    /// Show ledger and follower statistics
    Stats,
}

#[derive(Subcommand)]
pub enum CircleCommands {
    /// Create a circle
    Create {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        name: String,
    },
    /// Add a follower to a circle
    Add {
        #[arg(long)]
        circle: String,
        #[arg(long)]
        follower: String,
    },
    /// Remove a follower from a circle
    Remove {
        #[arg(long)]
        circle: String,
        #[arg(long)]
        follower: String,
    },
    /// List the followers of a circle
    Roster {
        circle: String,
    },
}

#[derive(Subcommand)]
pub enum FollowerCommands {
    /// Create a follower
    Create {
        #[arg(long)]
        user: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        personality: String,
        /// instant, active, casual or zen
        #[arg(long, default_value = "active")]
        responsiveness: Responsiveness,
        /// Percent chance of reacting to content (0-100)
        #[arg(long, default_value = "50")]
        chance: u8,
        /// Minimum reply delay in minutes, overriding the responsiveness class
        #[arg(long, requires = "delay_max")]
        delay_min: Option<u32>,
        /// Maximum reply delay in minutes
        #[arg(long, requires = "delay_min")]
        delay_max: Option<u32>,
        /// Comma separated interests
        #[arg(long, value_delimiter = ',')]
        interests: Vec<String>,
        #[arg(long)]
        background: Option<String>,
        #[arg(long)]
        style: Option<String>,
    },
    /// List followers
    List {
        #[arg(long)]
        user: Option<String>,
    },
    /// Let a follower react to content again
    Activate {
        id: String,
    },
    /// Stop a follower from being selected
    Deactivate {
        id: String,
    },
}

#[derive(Subcommand)]
pub enum PostCommands {
    /// Publish a new post
    Create {
        #[arg(long)]
        user: String,
        /// Limit the audience to one circle
        #[arg(long)]
        circle: Option<String>,
        #[arg(long)]
        content: String,
    },
    /// Publish a draft right away and schedule responses for it
    Now {
        id: String,
    },
}

#[derive(Subcommand)]
pub enum LabCommands {
    /// Create a lab
    Create {
        #[arg(long)]
        user: String,
        #[arg(long)]
        name: String,
    },
    /// Add a draft post to a lab
    Draft {
        #[arg(long)]
        lab: String,
        #[arg(long)]
        circle: Option<String>,
        #[arg(long)]
        content: String,
    },
    /// Publish every draft of a lab
    Activate {
        id: String,
    },
    /// Complete posts whose responses are all resolved
    Settle {
        id: String,
    },
}

#[derive(Subcommand)]
pub enum DeleteCommands {
    Post { id: String },
    Interaction { id: String },
}
