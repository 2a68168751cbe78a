use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Resolve city names against a gazetteer", long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database file (overrides the configured backend)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load a countries-states-cities `cities.csv` export (needs --db or a
    /// configured database file)
    Import {
        csv: PathBuf,

        /// Only import these ISO2 country codes
        #[arg(long = "country", value_name = "CODE")]
        countries: Vec<String>,

        #[arg(long, default_value_t = geodash::importer::DEFAULT_BATCH_SIZE)]
        batch_size: usize,

        /// Skip the import when the store already has records
        #[arg(long)]
        if_empty: bool,
    },

    /// Resolve a free-text place name
    Search {
        text: String,

        #[command(flatten)]
        location: LocationArgs,

        /// Restrict results to this ISO2 country
        #[arg(long)]
        country: Option<String>,

        /// Caller's ISO2 country, boosted in the ranking
        #[arg(long)]
        from_country: Option<String>,

        #[arg(short, long)]
        limit: Option<usize>,

        /// Minimum fuzzy score, 0-100
        #[arg(short, long)]
        threshold: Option<u8>,
    },

    /// Places around a coordinate, nearest first
    Nearby {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        #[arg(long, allow_hyphen_values = true)]
        lon: f64,

        #[arg(short, long, default_value_t = 10.0)]
        radius_km: f64,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Look up one place by id
    City { id: i64 },

    /// List countries with their place counts
    Countries,

    /// List the states of a country (code or name)
    States { country: String },

    /// List the places in a state (code or name) of a country (code or name)
    Cities { state: String, country: String },

    /// Row counts and index availability
    Stats,
}

#[derive(ClapArgs, Debug)]
pub struct LocationArgs {
    /// Caller latitude
    #[arg(long, requires = "lon", allow_hyphen_values = true)]
    pub lat: Option<f64>,

    /// Caller longitude
    #[arg(long, requires = "lat", allow_hyphen_values = true)]
    pub lon: Option<f64>,
}

impl LocationArgs {
    pub fn point(&self) -> Option<(f64, f64)> {
        self.lat.zip(self.lon)
    }
}
