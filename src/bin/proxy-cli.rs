use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use reverse_proxy_core::config::builder::DynamicConfigBuilder;
use reverse_proxy_core::config::errors::ConfigErrors;
use reverse_proxy_core::config::loader::{load_settings, load_snapshot};
use reverse_proxy_core::config::route_validator::StaticPolicies;
use reverse_proxy_core::observability::logging::init_logging;
use reverse_proxy_core::registry::PolicyRegistries;

#[derive(Parser)]
#[command(name = "proxy-cli")]
#[command(about = "Offline tooling for reverse proxy configuration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dry-run one reconciliation pass over a JSON config snapshot
    Validate {
        /// Snapshot file (JSON clusters + routes)
        snapshot: PathBuf,

        /// Settings file (TOML)
        #[arg(short, long)]
        settings: Option<PathBuf>,

        /// Authorization policy names routes may reference
        #[arg(long = "authorization-policy")]
        authorization_policies: Vec<String>,

        /// CORS policy names routes may reference
        #[arg(long = "cors-policy")]
        cors_policies: Vec<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate {
            snapshot,
            settings,
            authorization_policies,
            cors_policies,
        } => validate(snapshot, settings, authorization_policies, cors_policies),
    }
}

fn validate(
    snapshot: PathBuf,
    settings: Option<PathBuf>,
    authorization_policies: Vec<String>,
    cors_policies: Vec<String>,
) -> ExitCode {
    let settings = match settings.as_deref().map(load_settings).transpose() {
        Ok(settings) => settings.unwrap_or_default(),
        Err(e) => {
            eprintln!("Error: failed to load settings: {}", e);
            return ExitCode::from(2);
        }
    };
    let _ = init_logging(&settings.observability);

    let raw = match load_snapshot(&snapshot) {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("Error: failed to load {}: {}", snapshot.display(), e);
            return ExitCode::from(2);
        }
    };

    let mut policies = StaticPolicies::new();
    for name in &authorization_policies {
        policies = policies.with_authorization_policy(name);
    }
    for name in &cors_policies {
        policies = policies.with_cors_policy(name);
    }

    let builder = DynamicConfigBuilder::new(Vec::new(), Arc::new(policies), Arc::new(PolicyRegistries::builtin()));
    let mut errors = ConfigErrors::new();
    let root = builder.build(raw, &mut errors);

    println!("Clusters ({}):", root.clusters.len());
    for (id, cluster) in &root.clusters {
        println!(
            "  {} destinations={} load_balancing={}",
            id,
            cluster.destinations.len(),
            cluster.load_balancing.mode.as_deref().unwrap_or("default")
        );
    }

    println!("Routes ({}), in evaluation order:", root.routes.len());
    for route in &root.routes {
        println!(
            "  {} priority={} cluster={}",
            route.route_id,
            route.sort_key().0,
            route.cluster_id.as_deref().unwrap_or("-")
        );
    }

    if errors.is_empty() {
        println!("No errors");
        return ExitCode::SUCCESS;
    }

    println!("Errors ({}):", errors.len());
    for e in errors.iter() {
        println!("  [{:?}] {}", e.code, e);
    }
    ExitCode::FAILURE
}
