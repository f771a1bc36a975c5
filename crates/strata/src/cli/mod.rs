//! CLI command definitions and handlers.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use serde::Serialize;
use strata_common::{ByteQuantity, BundleId, IdMapping, IdMappings};

use crate::config::StoreConfig;
use crate::manager::{CleanOutcome, CreateSpec, Strata};

/// Strata - Layered rootfs store for containers
#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Store directory
    #[arg(long, global = true, env = "STRATA_STORE")]
    pub store: Option<PathBuf>,

    /// YAML configuration file
    #[arg(long, global = true, env = "STRATA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Store commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a store
    InitStore {
        /// UID mapping as namespace_id:host_id:size
        #[arg(long = "uid-mapping")]
        uid_mappings: Vec<IdMapping>,

        /// GID mapping as namespace_id:host_id:size
        #[arg(long = "gid-mapping")]
        gid_mappings: Vec<IdMapping>,

        /// Use the subordinate ids of the current user
        #[arg(long, conflicts_with_all = ["uid_mappings", "gid_mappings"])]
        rootless: bool,
    },

    /// Create a bundle from a base image
    Create {
        /// Base image (path to a tarball, oci:///path[:tag])
        image: String,

        /// Bundle ID
        id: BundleId,

        /// Disk limit of the bundle (e.g. 512Mi, 1G)
        #[arg(long)]
        disk_limit: Option<ByteQuantity>,

        /// Do not count the base image against the disk limit
        #[arg(long)]
        exclude_image_from_quota: bool,

        /// Collect unused volumes first
        #[arg(long)]
        clean: bool,
    },

    /// Delete a bundle
    Delete {
        /// Bundle ID
        id: BundleId,
    },

    /// Remove volumes no image or bundle uses
    Clean {
        /// Only clean when the store is larger than this (e.g. 10Gi)
        #[arg(long)]
        threshold: Option<ByteQuantity>,
    },

    /// List bundles
    List,

    /// Show disk usage of a bundle
    Stats {
        /// Bundle ID
        id: BundleId,
    },

    /// Show the image configuration of a bundle
    Config {
        /// Bundle ID
        id: BundleId,
    },

    /// Remove the whole store
    DeleteStore,
}

/// One line of `list` output.
#[derive(Serialize)]
struct ListEntry {
    id: String,
    source: String,
    rootfs: PathBuf,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl Cli {
    /// Configuration from the config file, overridden by flags.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be loaded.
    pub fn load_config(&self) -> Result<StoreConfig> {
        let mut config = match &self.config {
            Some(path) => StoreConfig::from_file(path)?,
            None => StoreConfig::default(),
        };

        if let Some(store) = &self.store {
            config = config.with_store(store);
        }
        if self.debug {
            config.log_level = "debug".to_string();
        }

        Ok(config)
    }

    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub fn execute(self, config: StoreConfig) -> Result<()> {
        match self.command {
            Commands::InitStore {
                uid_mappings,
                gid_mappings,
                rootless,
            } => {
                let mappings = if rootless {
                    IdMappings::rootless()
                } else if uid_mappings.is_empty() && gid_mappings.is_empty() {
                    config.mappings()
                } else {
                    IdMappings::new(uid_mappings, gid_mappings)
                };

                let config = config.with_mappings(mappings);
                Strata::init_store(&config).wrap_err("Failed to initialize store")?;

                println!("Store initialized at {}", config.store.display());
                Ok(())
            }

            Commands::Create {
                image,
                id,
                disk_limit,
                exclude_image_from_quota,
                clean,
            } => {
                let store = Strata::open(&config)?;

                let mut spec = CreateSpec::new(image, id).with_config(&config);
                if let Some(limit) = disk_limit {
                    spec.disk_limit_bytes = limit.as_bytes();
                }
                spec.exclude_image_from_quota |= exclude_image_from_quota;
                spec.clean_on_create |= clean;

                let bundle = store
                    .create(&spec)
                    .wrap_err_with(|| format!("Failed to create bundle {}", spec.id))?;

                println!("{}", serde_json::to_string_pretty(&bundle)?);
                Ok(())
            }

            Commands::Delete { id } => {
                let store = Strata::open(&config)?;
                store
                    .delete(&id)
                    .wrap_err_with(|| format!("Failed to delete bundle {id}"))?;

                println!("Bundle {id} deleted");
                Ok(())
            }

            Commands::Clean { threshold } => {
                let store = Strata::open(&config)?;
                let threshold =
                    threshold.map_or(config.clean_threshold_bytes, |t| t.as_bytes());

                match store.clean(threshold).wrap_err("Failed to clean store")? {
                    CleanOutcome::Skipped { bytes_used } => {
                        println!(
                            "Store uses {} which is within the threshold, nothing to clean",
                            ByteQuantity::bytes(bytes_used)
                        );
                    }
                    CleanOutcome::Collected(report) => {
                        println!("Removed {} unused volume(s)", report.destroyed.len());
                    }
                }
                Ok(())
            }

            Commands::List => {
                let store = Strata::open(&config)?;
                let entries: Vec<ListEntry> = store
                    .list()?
                    .into_iter()
                    .map(|b| ListEntry {
                        id: b.metadata.id.to_string(),
                        source: b.metadata.source,
                        rootfs: b.rootfs,
                        created_at: b.metadata.created_at,
                    })
                    .collect();

                println!("{}", serde_json::to_string_pretty(&entries)?);
                Ok(())
            }

            Commands::Stats { id } => {
                let store = Strata::open(&config)?;
                let stats = store.stats(&id)?;
                println!("{}", serde_json::to_string_pretty(&stats)?);
                Ok(())
            }

            Commands::Config { id } => {
                let store = Strata::open(&config)?;
                let image = store.image_config(&id)?;
                println!("{}", serde_json::to_string_pretty(&image)?);
                Ok(())
            }

            Commands::DeleteStore => {
                let root = config.store.clone();
                match Strata::open(&config) {
                    Ok(store) => store.delete_store().wrap_err("Failed to delete store")?,
                    Err(strata_common::StrataError::StoreNotInitialized { .. }) => {
                        crate::filesystem::remove_tree(&root)?;
                    }
                    Err(e) => return Err(e.into()),
                }

                println!("Store {} deleted", root.display());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_create() {
        let cli = Cli::try_parse_from([
            "strata",
            "--store",
            "/tmp/store",
            "create",
            "/images/rootfs.tar",
            "web-1",
            "--disk-limit",
            "1Gi",
        ])
        .unwrap();

        match cli.command {
            Commands::Create { id, disk_limit, .. } => {
                assert_eq!(id.as_str(), "web-1");
                assert_eq!(disk_limit, Some(ByteQuantity::gibibytes(1)));
            }
            _ => panic!("expected create"),
        }
    }

    #[test]
    fn flags_override_config() {
        let cli =
            Cli::try_parse_from(["strata", "--store", "/tmp/other", "--debug", "list"]).unwrap();
        let config = cli.load_config().unwrap();
        assert_eq!(config.store, PathBuf::from("/tmp/other"));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn rejects_invalid_bundle_ids() {
        assert!(Cli::try_parse_from(["strata", "delete", "../etc"]).is_err());
    }
}
