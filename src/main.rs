// Registry Regularizer - command line front-end
//
// Every subcommand goes through RegularizationEngine, the same surface the
// API server uses. Results print as pretty JSON so they can be piped.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use registry_regularizer::{
    Assignment, Coupling, Dimension, EngineConfig, ExpansionOptions, MappingKey,
    RegistrationFilter, RegularizationEngine, RegularizationMapping, YearPartition,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "registry-regularizer")]
#[command(about = "Map uncurated vehicle registry codes onto the canonical taxonomy")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "REGULARIZER_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// SQLite database (overrides the configured path)
    #[arg(long, global = true, env = "REGULARIZER_DATABASE", value_name = "PATH")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a registrations CSV (year,make,model,model_year,fuel_type,vehicle_type)
    Import {
        #[arg(value_name = "CSV")]
        path: PathBuf,
    },
    /// Print the canonical Make → Model → ModelYear hierarchy
    Hierarchy {
        #[arg(long)]
        refresh: bool,
    },
    /// List Make/Model pairs seen only in uncurated years
    Pairs {
        /// Also list exact text matches still lacking fuel/vehicle-type assignment
        #[arg(long)]
        include_exact: bool,
    },
    /// Create wildcard mappings for pairs whose text matches a canonical pair
    AutoRegularize,
    /// Map an uncurated pair onto a canonical pair
    Map {
        make: String,
        model: String,
        canonical_make: String,
        canonical_model: String,
        /// Vehicle type code, "unknown" or "unassigned"
        #[arg(long, default_value = "unassigned")]
        vehicle_type: String,
        /// Per model year fuel type, e.g. 2008=E (repeatable)
        #[arg(long = "fuel", value_name = "YEAR=FUEL")]
        fuels: Vec<String>,
        /// Fill per-year fuel types from the canonical pair's curated data
        #[arg(long)]
        propose_fuels: bool,
    },
    /// Remove mappings for an uncurated pair (one model year, or all)
    Unmap {
        make: String,
        model: String,
        #[arg(long, value_name = "MODEL_YEAR")]
        model_year: Option<String>,
    },
    /// Show mappings, optionally for one uncurated pair
    Mappings {
        make: Option<String>,
        model: Option<String>,
    },
    /// Expand make/model codes through the mapping graph
    Expand {
        #[arg(long = "make", value_name = "CODE")]
        makes: Vec<String>,
        #[arg(long = "model", value_name = "CODE")]
        models: Vec<String>,
        #[arg(long, value_enum)]
        coupling: Option<CliCoupling>,
        #[arg(long)]
        no_regularization: bool,
    },
    /// Count registrations matching a filter
    Count {
        #[command(flatten)]
        filter: FilterArgs,
        /// Break the count down by registration year
        #[arg(long)]
        by_year: bool,
    },
    /// Report whether an uncurated pair is fully regularized
    Completeness { make: String, model: String },
    /// Suggest canonical pairs for an uncurated pair
    Suggest {
        make: String,
        model: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Replace the curated/uncurated year split
    Partition {
        #[arg(long, value_delimiter = ',', required = true)]
        curated: Vec<i64>,
        #[arg(long, value_delimiter = ',', required = true)]
        uncurated: Vec<i64>,
    },
    /// Mark derived caches stale and show cache status
    Invalidate,
    /// Mapping and cache statistics
    Stats,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliCoupling {
    Coupled,
    Decoupled,
}

impl From<CliCoupling> for Coupling {
    fn from(value: CliCoupling) -> Self {
        match value {
            CliCoupling::Coupled => Coupling::Coupled,
            CliCoupling::Decoupled => Coupling::Decoupled,
        }
    }
}

#[derive(clap::Args)]
struct FilterArgs {
    #[arg(long = "year", value_delimiter = ',')]
    years: Vec<i64>,
    #[arg(long = "make", value_name = "CODE")]
    makes: Vec<String>,
    #[arg(long = "model", value_name = "CODE")]
    models: Vec<String>,
    #[arg(long = "model-year", value_name = "CODE")]
    model_years: Vec<String>,
    #[arg(long = "fuel", value_name = "CODE")]
    fuel_types: Vec<String>,
    #[arg(long = "vehicle-type", value_name = "CODE")]
    vehicle_types: Vec<String>,
    #[arg(long, value_enum)]
    coupling: Option<CliCoupling>,
    #[arg(long)]
    no_regularization: bool,
    /// Let fuel mappings match model years before fuel data was recorded
    #[arg(long)]
    expand_fuel_before_field_exists: Option<bool>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(database) = &cli.database {
        config.database_path = database.clone();
    }

    info!("Using database {}", config.database_path.display());
    let engine = RegularizationEngine::open(config).context("Failed to open regularization engine")?;

    run(&engine, cli.command)
}

fn run(engine: &RegularizationEngine, command: Command) -> Result<()> {
    match command {
        Command::Import { path } => {
            let report = engine
                .import_csv(&path)
                .with_context(|| format!("Failed to import {}", path.display()))?;
            print_json(&report)
        }
        Command::Hierarchy { refresh } => print_json(&*engine.build_canonical_hierarchy(refresh)?),
        Command::Pairs { include_exact } => print_json(&engine.find_uncurated_pairs(include_exact)?),
        Command::AutoRegularize => print_json(&engine.auto_regularize()?),
        Command::Map {
            make,
            model,
            canonical_make,
            canonical_model,
            vehicle_type,
            fuels,
            propose_fuels,
        } => {
            let uncurated = resolve_pair(engine, &make, &model)?;
            let canonical = resolve_pair(engine, &canonical_make, &canonical_model)?;
            let vehicle_type = resolve_assignment(engine, Dimension::VehicleType, &vehicle_type)?;

            engine.save_mapping(
                &RegularizationMapping::wildcard(uncurated, canonical).with_vehicle_type(vehicle_type),
            )?;

            let mut per_year = if propose_fuels {
                engine.propose_year_triplets(canonical)?
            } else {
                BTreeMap::new()
            };
            for entry in &fuels {
                let (model_year, fuel) = entry
                    .split_once('=')
                    .ok_or_else(|| anyhow!("expected MODEL_YEAR=FUEL, got '{}'", entry))?;
                per_year.insert(
                    engine.resolve_code(Dimension::ModelYear, model_year)?,
                    resolve_assignment(engine, Dimension::FuelType, fuel)?,
                );
            }
            if !per_year.is_empty() {
                let saved = engine.save_year_triplets(uncurated, canonical, &per_year)?;
                info!("Saved {} model-year mappings", saved);
            }

            print_json(&engine.pair_completeness(uncurated.0, uncurated.1)?)
        }
        Command::Unmap { make, model, model_year } => {
            let (make_id, model_id) = resolve_pair(engine, &make, &model)?;
            let removed = match model_year {
                Some(code) => {
                    let key = MappingKey {
                        uncurated_make_id: make_id,
                        uncurated_model_id: model_id,
                        model_year_id: Some(engine.resolve_code(Dimension::ModelYear, &code)?),
                    };
                    usize::from(engine.delete_mapping(&key)?)
                }
                None => engine.delete_pair_mappings(make_id, model_id)?,
            };
            print_json(&serde_json::json!({ "removed": removed }))
        }
        Command::Mappings { make, model } => match (make, model) {
            (Some(make), Some(model)) => {
                let (make_id, model_id) = resolve_pair(engine, &make, &model)?;
                print_json(&engine.mappings_for_pair(make_id, model_id)?)
            }
            (None, None) => print_json(&engine.mappings()?),
            _ => Err(anyhow!("give both MAKE and MODEL, or neither")),
        },
        Command::Expand { makes, models, coupling, no_regularization } => {
            let defaults = engine.expansion_options();
            let options = ExpansionOptions {
                enabled: defaults.enabled && !no_regularization,
                coupling: coupling.map(Coupling::from).unwrap_or(defaults.coupling),
            };
            let makes = resolve_codes(engine, Dimension::Make, &makes)?;
            let models = resolve_codes(engine, Dimension::Model, &models)?;
            print_json(&engine.expand_selection(&makes, &models, options)?)
        }
        Command::Count { filter, by_year } => {
            let mut options = engine.query_options();
            if filter.no_regularization {
                options.regularization_enabled = false;
            }
            if let Some(coupling) = filter.coupling {
                options.coupling = coupling.into();
            }
            if let Some(toggle) = filter.expand_fuel_before_field_exists {
                options.expand_fuel_before_field_exists = toggle;
            }

            let filter = RegistrationFilter {
                years: filter.years.iter().copied().collect(),
                makes: resolve_codes(engine, Dimension::Make, &filter.makes)?,
                models: resolve_codes(engine, Dimension::Model, &filter.models)?,
                model_years: resolve_codes(engine, Dimension::ModelYear, &filter.model_years)?,
                fuel_types: resolve_codes(engine, Dimension::FuelType, &filter.fuel_types)?,
                vehicle_types: resolve_codes(engine, Dimension::VehicleType, &filter.vehicle_types)?,
            };

            if by_year {
                print_json(&engine.count_registrations_by_year(&filter, &options)?)
            } else {
                print_json(&serde_json::json!({ "count": engine.count_registrations(&filter, &options)? }))
            }
        }
        Command::Completeness { make, model } => {
            let (make_id, model_id) = resolve_pair(engine, &make, &model)?;
            print_json(&engine.pair_completeness(make_id, model_id)?)
        }
        Command::Suggest { make, model, limit } => {
            let (make_id, model_id) = resolve_pair(engine, &make, &model)?;
            print_json(&engine.suggest_canonical_pairs(make_id, model_id, limit)?)
        }
        Command::Partition { curated, uncurated } => {
            engine.set_year_partition(YearPartition::new(curated, uncurated)?)?;
            print_json(&engine.year_partition())
        }
        Command::Invalidate => {
            engine.invalidate_caches()?;
            print_json(&engine.cache_status())
        }
        Command::Stats => print_json(&serde_json::json!({
            "mappings": engine.mapping_statistics()?,
            "caches": engine.cache_status(),
            "partition": engine.year_partition(),
        })),
    }
}

fn resolve_pair(engine: &RegularizationEngine, make: &str, model: &str) -> Result<(i64, i64)> {
    Ok((
        engine.resolve_code(Dimension::Make, make)?,
        engine.resolve_code(Dimension::Model, model)?,
    ))
}

fn resolve_codes(engine: &RegularizationEngine, dimension: Dimension, codes: &[String]) -> Result<BTreeSet<i64>> {
    codes
        .iter()
        .map(|code| engine.resolve_code(dimension, code).map_err(Into::into))
        .collect()
}

/// "unknown" / "unassigned" keywords, otherwise a code of `dimension`
fn resolve_assignment(engine: &RegularizationEngine, dimension: Dimension, value: &str) -> Result<Assignment> {
    match Assignment::parse(value) {
        Some(Assignment::Assigned(_)) | None => Ok(Assignment::Assigned(engine.resolve_code(dimension, value)?)),
        Some(keyword) => Ok(keyword),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
