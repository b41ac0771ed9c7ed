//! nat CLI - run programs through the embedded nat VM.
//!
//! # Usage
//!
//! ```bash
//! # Stage a source tree and interpret its entry point
//! nat --sandbox ./src interpret main
//!
//! # Stream generated chunks
//! nat generate doc/index
//!
//! # Show what the VM sees
//! nat tree core
//! ```

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nat_wasm_runtime::{Runtime, RuntimeConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "nat")]
#[command(about = "nat CLI - run programs through the embedded nat VM")]
#[command(version)]
pub struct Args {
    /// Path to the nat WASM module
    #[arg(long, short = 'm', env = "NAT_MODULE", default_value = "nat.wasm", global = true)]
    pub module: PathBuf,

    /// Host directory to use as the sandbox root (temporary if unset)
    #[arg(long, short = 's', env = "NAT_SANDBOX", global = true)]
    pub sandbox: Option<PathBuf>,

    /// Output format (text, json)
    #[arg(long, short = 'f', default_value = "text", global = true)]
    pub format: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Interpret a module once
    Interpret {
        /// Sandbox-relative module path
        path: String,
    },

    /// Stream generated output for a module
    Generate {
        /// Sandbox-relative module path
        path: String,

        /// Reset the VM before generating
        #[arg(long)]
        init: bool,
    },

    /// Typeset a module
    Typeset {
        /// Sandbox-relative module path
        path: String,
    },

    /// Compile source text as a module
    Compile {
        /// Module path to compile as
        path: String,

        /// Host file holding the source
        source: PathBuf,
    },

    /// Recursively list a sandbox directory
    Tree {
        #[arg(default_value = "core")]
        dir: String,
    },

    /// List the entries of a sandbox directory
    Ls {
        #[arg(default_value = ".")]
        dir: String,
    },

    /// Print a sandbox file
    Cat { path: String },

    /// Copy a host file into the sandbox
    Put {
        /// Sandbox-relative destination
        path: String,

        /// Host file to copy
        file: PathBuf,
    },

    /// Create a sandbox directory
    Mkdir { path: String },

    /// Remove a sandbox file
    Rm { path: String },
}

fn build_runtime(args: &Args) -> Result<Runtime> {
    let mut config = RuntimeConfig::from_file(&args.module);
    if let Some(dir) = &args.sandbox {
        config = config.with_sandbox_dir(dir);
    }
    Runtime::new(config).context("Failed to create nat runtime")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let args = Args::parse();
    let runtime = build_runtime(&args)?;
    let json = args.format == "json";

    match args.command {
        Command::Interpret { path } => {
            commands::eval::interpret(&runtime, &path, json).await?;
        }
        Command::Generate { path, init } => {
            commands::eval::generate(&runtime, &path, init, json).await?;
        }
        Command::Typeset { path } => {
            commands::eval::typeset(&runtime, &path, json).await?;
        }
        Command::Compile { path, source } => {
            commands::eval::compile(&runtime, &path, &source, json).await?;
        }
        Command::Tree { dir } => {
            commands::fs::tree(&runtime, &dir, json).await?;
        }
        Command::Ls { dir } => {
            commands::fs::ls(&runtime, &dir, json).await?;
        }
        Command::Cat { path } => {
            commands::fs::cat(&runtime, &path).await?;
        }
        Command::Put { path, file } => {
            commands::fs::put(&runtime, &path, &file).await?;
        }
        Command::Mkdir { path } => {
            commands::fs::mkdir(&runtime, &path).await?;
        }
        Command::Rm { path } => {
            commands::fs::rm(&runtime, &path).await?;
        }
    }

    Ok(())
}
