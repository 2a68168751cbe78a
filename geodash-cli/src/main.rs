//! geodash - command-line front end for the GeoDash resolver
//!
//! Run with: cargo run -p geodash-cli -- --db cities.db import cities.csv
//!           cargo run -p geodash-cli -- --db cities.db search Londn

mod args;

use anyhow::{Context, Result};
use args::{Cli, Command};
use clap::Parser;
use geodash::config::DatabaseConfig;
use geodash::{GeoDash, GeoDashConfig, GeoPoint, ImportOptions, PlaceId, PlaceRecord, QueryRequest};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("geodash={level},geodash_cli={level}")))?
        .add_directive("tantivy=warn".parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn load_config(cli: &Cli) -> Result<GeoDashConfig> {
    let config = match &cli.config {
        Some(path) => GeoDashConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => GeoDashConfig::default(),
    };
    Ok(match &cli.db {
        Some(db) => config.with_sqlite_path(db),
        None => config,
    })
}

/// An import into an in-memory store is lost when the process exits.
fn ensure_persistent(config: &GeoDashConfig) -> Result<()> {
    if let DatabaseConfig::Sqlite { path: None, .. } = config.database {
        anyhow::bail!(
            "import needs a persistent database: pass --db FILE or set database.path in the config"
        );
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn describe(place: &PlaceRecord) -> String {
    let region = match (&place.state_name, &place.country_name) {
        (Some(state), Some(country)) => format!("{state}, {country}"),
        (None, Some(country)) => country.clone(),
        (Some(state), None) => format!("{state}, {}", place.country_code),
        (None, None) => place.country_code.clone(),
    };
    format!(
        "#{:<8} {} ({}) [{:.4}, {:.4}]",
        place.id, place.name, region, place.latitude, place.longitude
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;
    tracing::debug!(?cli, "Parsed arguments");

    let config = load_config(&cli)?;
    if matches!(cli.command, Command::Import { .. }) {
        ensure_persistent(&config)?;
    }
    let geo = GeoDash::open(config).context("Failed to open GeoDash")?;

    match cli.command {
        Command::Import {
            ref csv,
            ref countries,
            batch_size,
            if_empty,
        } => {
            let options = ImportOptions {
                countries: countries.clone(),
                batch_size,
            };
            if if_empty && geo.stats()?.places > 0 {
                println!("Store already populated, nothing imported");
                return Ok(());
            }

            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} [{elapsed_precise}] {msg}")?,
            );
            pb.enable_steady_tick(Duration::from_millis(120));
            let report = geo
                .import_csv_with_progress(csv, options, |report| {
                    pb.set_message(format!(
                        "{} loaded, {} skipped, {} failed",
                        report.loaded,
                        report.skipped,
                        report.failures.len()
                    ));
                })
                .with_context(|| format!("Failed to import {}", csv.display()))?;
            pb.finish_and_clear();

            if cli.json {
                print_json(&serde_json::json!({
                    "read": report.read,
                    "loaded": report.loaded,
                    "skipped": report.skipped,
                    "failures": report.failures.iter().map(|f| serde_json::json!({
                        "line": f.line,
                        "id": f.id,
                        "reason": f.reason,
                    })).collect::<Vec<_>>(),
                }))?;
            } else {
                println!(
                    "Read {} rows: {} loaded, {} skipped, {} failed",
                    report.read,
                    report.loaded,
                    report.skipped,
                    report.failures.len()
                );
                for failure in report.failures.iter().take(20) {
                    println!("  line {}: {}", failure.line, failure.reason);
                }
                if report.failures.len() > 20 {
                    println!("  ... {} more", report.failures.len() - 20);
                }
            }
        }

        Command::Search {
            text,
            location,
            country,
            from_country,
            limit,
            threshold,
        } => {
            let mut request = QueryRequest::new(text);
            if let Some((lat, lon)) = location.point() {
                request = request.near(lat, lon);
            }
            request.country = country;
            request.caller_country = from_country;
            request.limit = limit;
            request.threshold = threshold;

            let resolution = geo.search(request).await.context("Search failed")?;
            if cli.json {
                print_json(resolution.results.as_slice())?;
            } else if resolution.is_empty() {
                println!("No matches");
            } else {
                for hit in resolution.results.iter() {
                    let distance = hit
                        .distance_km
                        .map(|d| format!(" {d:.1} km"))
                        .unwrap_or_default();
                    println!(
                        "{:>3} {:>10.1} {}{}",
                        hit.fuzzy_score,
                        hit.fused_score,
                        describe(&hit.place),
                        distance
                    );
                }
            }
        }

        Command::Nearby {
            lat,
            lon,
            radius_km,
            limit,
        } => {
            let places = geo
                .nearby(GeoPoint { lat, lon }, radius_km, limit)
                .context("Nearby lookup failed")?;
            if cli.json {
                print_json(&places)?;
            } else {
                for near in &places {
                    println!("{:>8.2} km {}", near.distance_km, describe(&near.place));
                }
            }
        }

        Command::City { id } => match geo.city(PlaceId(id))? {
            Some(place) if cli.json => print_json(&place)?,
            Some(place) => println!("{}", describe(&place)),
            None => anyhow::bail!("No place with id {id}"),
        },

        Command::Countries => {
            let countries = geo.countries()?;
            if cli.json {
                print_json(&countries)?;
            } else {
                for country in &countries {
                    println!(
                        "{} {:<40} {:>8}",
                        country.code,
                        country.name.as_deref().unwrap_or("-"),
                        country.places
                    );
                }
            }
        }

        Command::States { ref country } => {
            let states = geo.states(country)?;
            if cli.json {
                print_json(&states)?;
            } else {
                for state in &states {
                    println!(
                        "{:<6} {:<40} {:>8}",
                        state.code.as_deref().unwrap_or("-"),
                        state.name.as_deref().unwrap_or("-"),
                        state.places
                    );
                }
            }
        }

        Command::Cities {
            ref state,
            ref country,
        } => {
            let places = geo.cities_in_state(state, country)?;
            if cli.json {
                print_json(&places)?;
            } else {
                for place in &places {
                    println!("{}", describe(place));
                }
            }
        }

        Command::Stats => {
            let stats = geo.stats()?;
            if cli.json {
                print_json(&stats)?;
            } else {
                println!("backend:       {}", stats.backend);
                println!("places:        {}", stats.places);
                println!("countries:     {}", stats.countries);
                println!("spatial index: {}", stats.spatial_index);
                println!("text index:    {}", stats.text_index);
            }
        }
    }

    geo.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_requires_a_database_file() {
        let cli = Cli::parse_from(["geodash", "import", "cities.csv"]);
        let config = load_config(&cli).unwrap();
        let err = ensure_persistent(&config).unwrap_err();
        assert!(err.to_string().contains("--db"));

        let cli = Cli::parse_from(["geodash", "--db", "cities.db", "import", "cities.csv"]);
        assert!(ensure_persistent(&load_config(&cli).unwrap()).is_ok());
    }

    #[test]
    fn test_postgres_counts_as_persistent() {
        let mut config = GeoDashConfig::default();
        config.database = DatabaseConfig::Postgres {
            url: "postgres://localhost/geodash".into(),
        };
        assert!(ensure_persistent(&config).is_ok());
    }
}
