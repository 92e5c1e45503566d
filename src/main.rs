use anyhow::{Context, Result, bail};
use asset_catalog::asset::AssetRecord;
use asset_catalog::cli::{Cli, Commands};
use asset_catalog::config::{
    CatalogConfig, ContentRoot, LOG_ENV, resolve_cache_path, resolve_catalog_path,
    resolve_config_path,
};
use asset_catalog::dependency::DependencyCategory;
use asset_catalog::filter::AssetFilter;
use asset_catalog::gatherer::{BackgroundGatherer, Gatherer};
use asset_catalog::registry::{Registry, RegistryStats};
use asset_catalog::scan_cache::ScanCache;
use clap::Parser;
use serde::Serialize;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const SCAN_TIMEOUT_SECS: u64 = 600;

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.clone() {
        Commands::Scan {
            root,
            mount,
            out,
            threads,
            sync,
        } => {
            let catalog = match out {
                Some(out) => out,
                None => resolve_catalog_path(&cli)?,
            };
            let output = scan(&cli, &root, &mount, &catalog, threads, sync)?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Query {
            package,
            path,
            recursive,
            class,
            subclasses,
            tag,
            object,
        } => {
            let registry = open_catalog(&cli)?;
            let mut filter = AssetFilter::new()
                .recursive_paths(recursive)
                .recursive_classes(subclasses);
            for name in package.iter() {
                filter = filter.package_name(name);
            }
            for name in path.iter() {
                filter = filter.package_path(name);
            }
            for name in class.iter() {
                filter = filter.class_name(name);
            }
            for name in object.iter() {
                filter = filter.object_path(name);
            }
            for entry in tag.iter() {
                let (key, value) = parse_tag(entry)?;
                filter = filter.tag(key, value);
            }

            let records: Vec<AssetRecord> = if filter.is_empty() {
                registry.get_all_assets(true)
            } else {
                match registry.get_assets(&filter) {
                    Some(records) => records,
                    None => bail!("Invalid query filter"),
                }
            };
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Commands::Deps { package, category } => {
            let registry = open_catalog(&cli)?;
            let mask = parse_category(&category)?;
            let Some(packages) = registry.get_package_dependencies(&package, mask) else {
                bail!("Package not in catalog: {package}");
            };
            let output = EdgeOutput {
                package,
                category,
                packages,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Refs { package, category } => {
            let registry = open_catalog(&cli)?;
            let mask = parse_category(&category)?;
            let Some(packages) = registry.get_package_referencers(&package, mask) else {
                bail!("Package not in catalog: {package}");
            };
            let output = EdgeOutput {
                package,
                category,
                packages,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Stats => {
            let catalog = resolve_catalog_path(&cli)?;
            let registry = open_catalog(&cli)?;
            let output = StatsOutput {
                catalog: catalog.to_string_lossy().to_string(),
                stats: registry.stats(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<CatalogConfig> {
    let path = resolve_config_path(cli)?;
    CatalogConfig::load_or_default(Some(&path))
}

fn open_catalog(cli: &Cli) -> Result<Registry> {
    let config = load_config(cli)?;
    let catalog = resolve_catalog_path(cli)?;
    let mut registry = Registry::new(&config);
    registry
        .load(&catalog)
        .with_context(|| format!("Failed to open catalog: {}", catalog.display()))?;
    Ok(registry)
}

#[derive(Debug, Serialize)]
struct ScanOutput {
    catalog: String,
    scanned_root: String,
    mount: String,
    assets: usize,
    packages: usize,
    paths: usize,
    cooked_without_metadata: usize,
    bytes_written: usize,
    duration_ms: u64,
}

#[derive(Debug, Serialize)]
struct EdgeOutput {
    package: String,
    category: String,
    packages: Vec<String>,
}

#[derive(Debug, Serialize)]
struct StatsOutput {
    catalog: String,
    #[serde(flatten)]
    stats: RegistryStats,
}

fn scan(
    cli: &Cli,
    root: &Path,
    mount: &str,
    catalog: &Path,
    threads: Option<usize>,
    sync: bool,
) -> Result<ScanOutput> {
    let start = Instant::now();
    let directory = root
        .canonicalize()
        .with_context(|| format!("Content root not found: {}", root.display()))?;

    let mut config = load_config(cli)?;
    config.registry.content_roots.push(ContentRoot {
        mount_point: mount.to_string(),
        directory: directory.clone(),
    });

    let cache = match resolve_cache_path(cli)? {
        Some(path) => match ScanCache::open(path) {
            Ok(cache) => Some(cache),
            Err(err) => {
                tracing::warn!("scan cache unavailable, parsing every manifest: {err:#}");
                None
            }
        },
        None => None,
    };

    let threads = threads.unwrap_or_else(default_threads);
    let gatherer = Gatherer::new(config.registry.content_roots.clone(), cache);
    let mut registry = Registry::new(&config).with_scanner(BackgroundGatherer::spawn(gatherer, threads));

    if sync {
        registry.search_all_assets(true);
    } else {
        registry.search_all_assets(false);
        if !registry.wait_for_completion(Duration::from_secs(SCAN_TIMEOUT_SECS)) {
            bail!("Scan did not finish within {SCAN_TIMEOUT_SECS} seconds");
        }
    }

    let bytes_written = registry
        .save(catalog, None)
        .with_context(|| format!("Failed to write catalog: {}", catalog.display()))?;
    let stats = registry.stats();

    Ok(ScanOutput {
        catalog: catalog.to_string_lossy().to_string(),
        scanned_root: directory.to_string_lossy().to_string(),
        mount: mount.to_string(),
        assets: stats.assets,
        packages: stats.packages,
        paths: stats.cached_paths,
        cooked_without_metadata: stats.cooked_packages_without_metadata,
        bytes_written,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn parse_tag(entry: &str) -> Result<(&str, &str)> {
    match entry.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim(), value.trim())),
        _ => bail!("Expected --tag KEY=VALUE, got: {entry}"),
    }
}

fn parse_category(name: &str) -> Result<DependencyCategory> {
    DependencyCategory::parse(name).with_context(|| format!("Unknown dependency category: {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_arguments_split_on_the_first_equals_sign() {
        assert_eq!(parse_tag("Color=Red").unwrap(), ("Color", "Red"));
        assert_eq!(parse_tag(" Path = a=b ").unwrap(), ("Path", "a=b"));
        assert!(parse_tag("=Red").is_err());
        assert!(parse_tag("Color").is_err());
    }

    #[test]
    fn categories_parse_case_insensitively() {
        assert_eq!(parse_category("HARD").unwrap(), DependencyCategory::HARD);
        assert!(parse_category("nope").is_err());
    }
}
