use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "modelrelay")]
#[command(about = "Dispatch prompts across LLM providers with retries and rate-limit fallback")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send a prompt through the dispatch queue
    Generate {
        /// Prompt text
        prompt: String,

        /// System prompt
        #[arg(short, long)]
        system: Option<String>,

        /// Pin the request to one provider
        #[arg(short, long)]
        provider: Option<String>,

        #[arg(long)]
        temperature: Option<f32>,

        #[arg(long)]
        max_tokens: Option<u32>,

        #[arg(long)]
        top_p: Option<f32>,

        /// Label shown in logs
        #[arg(short, long)]
        label: Option<String>,

        /// Print output as it is generated
        #[arg(long)]
        stream: bool,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Ask a model to rewrite a prompt whose output missed the mark
    Refine {
        /// The prompt that produced the unsatisfactory output
        #[arg(long)]
        original: String,

        /// The unsatisfactory output
        #[arg(long)]
        response: String,

        /// What the output should have looked like
        #[arg(long)]
        spec: String,

        /// Use a specific provider
        #[arg(short, long)]
        provider: Option<String>,
    },

    /// List configured providers and their status
    Providers {
        #[arg(long)]
        json: bool,
    },

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}
