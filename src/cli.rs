use clap::{Parser, Subcommand};

/// Run AI coding agents in full-auto mode inside disposable sandboxes.
#[derive(Parser)]
#[command(name = "yoloai", version, about)]
pub struct Cli {
    /// Profile whose config and resources to use.
    #[arg(long, global = true, default_value = "base")]
    pub profile: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a sandbox and launch the agent in it.
    New {
        name: String,
        /// Working directory: PATH[:ro|rw|copy] (default mode: copy).
        workdir: String,
        /// Agent to run.
        #[arg(long, default_value = "claude")]
        agent: String,
        /// Model name or alias, passed via the agent's model flag.
        #[arg(long)]
        model: Option<String>,
        /// Additional directories: PATH[:ro|rw|copy]. Repeatable.
        #[arg(short = 'd', long = "dir")]
        dirs: Vec<String>,
        /// Network policy: none or isolated.
        #[arg(long)]
        network: Option<String>,
        /// Extra allowlisted domains for isolated networking. Repeatable.
        #[arg(long = "network-allow")]
        network_allow: Vec<String>,
        /// Port mapping HOST:INSTANCE[/tcp|/udp]. Repeatable.
        #[arg(short = 'p', long = "port")]
        ports: Vec<String>,
        /// Initial prompt delivered to the agent.
        #[arg(long)]
        prompt: Option<String>,
        /// Replace an existing sandbox of the same name.
        #[arg(long)]
        replace: bool,
        /// Create everything but leave the instance stopped.
        #[arg(long)]
        no_start: bool,
        /// Answer yes to all confirmations.
        #[arg(short = 'y', long)]
        yes: bool,
        /// Allow overlapping directories and dangerous mount targets.
        #[arg(long)]
        force_paths: bool,
    },

    /// Attach the terminal to the agent's tmux session.
    Attach {
        name: Option<String>,
    },

    /// Show one sandbox in detail.
    #[command(alias = "info")]
    Show {
        name: Option<String>,
        #[arg(long)]
        json: bool,
    },

    /// Diff the sandbox's directories against their baselines.
    Diff {
        name: Option<String>,
        /// Summarize with --stat instead of a full patch.
        #[arg(long)]
        stat: bool,
        /// Limit to these paths.
        paths: Vec<String>,
    },

    /// Land the sandbox's changes in the host repository.
    Apply {
        name: Option<String>,
        /// One flattened diff instead of replaying commits.
        #[arg(long)]
        squash: bool,
        /// Write .patch files here instead of touching the host repo.
        #[arg(long, value_name = "DIR")]
        export: Option<std::path::PathBuf>,
        /// Leave uncommitted agent work behind.
        #[arg(long)]
        no_wip: bool,
        /// Apply even when the host repo is dirty.
        #[arg(long)]
        force: bool,
        /// Limit to these paths.
        paths: Vec<String>,
    },

    /// List all sandboxes.
    #[command(alias = "ls")]
    List {
        #[arg(long)]
        json: bool,
    },

    /// Print the captured agent session log.
    Log {
        name: Option<String>,
        /// Keep printing as the log grows.
        #[arg(short = 'f', long)]
        follow: bool,
    },

    /// Run a command inside the sandbox.
    Exec {
        name: Option<String>,
        /// Attach the terminal (PTY) instead of capturing output.
        #[arg(short = 'i', long)]
        interactive: bool,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        argv: Vec<String>,
    },

    /// Stop the sandbox's instance.
    Stop {
        name: Option<String>,
    },

    /// Start (or recreate and start) the sandbox's instance.
    Start {
        name: Option<String>,
    },

    /// Stop, then start.
    Restart {
        name: Option<String>,
    },

    /// Remove the instance and delete the sandbox directory.
    Destroy {
        name: Option<String>,
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Re-sync the work copy from the host directory.
    Reset {
        name: Option<String>,
        /// Resync in place while the agent keeps running.
        #[arg(long)]
        no_restart: bool,
        /// Also wipe the agent's state directory.
        #[arg(long)]
        clean: bool,
        /// Re-deliver the original prompt afterwards.
        #[arg(long)]
        reprompt: bool,
    },

    /// Build (or rebuild) the backend's base image.
    Build {
        #[arg(long)]
        force: bool,
    },

    /// Remove orphaned instances and stale temp state.
    Prune {
        #[arg(long)]
        dry_run: bool,
    },

    /// Add domains to a sandbox's network allowlist.
    NetworkAllow {
        name: Option<String>,
        #[arg(required = true)]
        domains: Vec<String>,
    },

    /// Read or change profile configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Manage profiles.
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    Get { key: String },
    Set { key: String, value: String },
    /// Restore the default configuration.
    Reset,
}

#[derive(Subcommand)]
pub enum ProfileAction {
    Create { name: String },
    List,
    Delete { name: String },
}
