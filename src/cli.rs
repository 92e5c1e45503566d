use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "asset-catalog")]
#[command(about = "Index package manifests into an asset catalog and query it")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Catalog file to read or write.
    #[arg(long, value_name = "FILE", global = true)]
    pub catalog: Option<PathBuf>,

    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Scan cache (LMDB) location.
    #[arg(long, value_name = "FILE", global = true)]
    pub cache: Option<PathBuf>,

    #[arg(long, global = true)]
    pub no_cache: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Scan a content directory and write the catalog.
    Scan {
        #[arg(long, value_name = "DIR")]
        root: PathBuf,

        #[arg(long, value_name = "PATH", default_value = "/Game")]
        mount: String,

        /// Write here instead of the catalog path.
        #[arg(short = 'o', long, value_name = "FILE")]
        out: Option<PathBuf>,

        #[arg(long, value_name = "N")]
        threads: Option<usize>,

        /// Scan on the calling thread instead of the background gatherer.
        #[arg(long)]
        sync: bool,
    },
    Query {
        #[arg(long, value_name = "NAME")]
        package: Vec<String>,

        #[arg(long, value_name = "PATH")]
        path: Vec<String>,

        #[arg(long)]
        recursive: bool,

        #[arg(long, value_name = "NAME")]
        class: Vec<String>,

        #[arg(long)]
        subclasses: bool,

        /// `Key=Value`; repeatable.
        #[arg(long, value_name = "K=V")]
        tag: Vec<String>,

        #[arg(long, value_name = "PATH")]
        object: Vec<String>,
    },
    Deps {
        package: String,

        /// hard, soft, searchable, manage, packages or all.
        #[arg(long, value_name = "CATEGORY", default_value = "all")]
        category: String,
    },
    Refs {
        package: String,

        #[arg(long, value_name = "CATEGORY", default_value = "all")]
        category: String,
    },
    Stats,
}
