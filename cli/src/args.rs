// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Command-line surface of the popmap tool.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "popmap",
    about = "Turn traceroute corpora into PoP-level topology graphs",
    long_about = None
)]
pub struct Cmdline {
    /// Store snapshot file shared by every subcommand.
    #[arg(long, value_name = "FILE", default_value = "popmap.db", global = true)]
    pub db: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Process traceroute data into PoP assignments
    #[command(subcommand)]
    Process(ProcessCommand),
    /// Create and reduce the topology graph
    #[command(subcommand)]
    Graph(GraphCommand),
}

#[derive(Subcommand)]
pub enum ProcessCommand {
    /// Parse trace routes, performing ASN lookups for IPs as we go
    Parse {
        /// ASN/country lookup table to use
        #[arg(long, value_name = "FILE", required = true)]
        geoipdb: PathBuf,
        /// Trace file in sc_warts2text form
        #[arg(value_name = "<trace file>")]
        trace: PathBuf,
    },
    /// Associate ASNs with all unique IPs from trace files, ahead of parsing
    #[command(name = "preprocess_traces")]
    PreprocessTraces {
        #[arg(long, value_name = "FILE", required = true)]
        geoipdb: PathBuf,
        /// Trace files to scan
        #[arg(required = true)]
        tracefiles: Vec<PathBuf>,
    },
    /// Dump all IPs from a traceroute file
    #[command(name = "dump_ips")]
    DumpIps {
        #[arg(value_name = "<trace file>")]
        trace: PathBuf,
    },
    /// Load IP attributes from a file. Will not set the 'pop' attribute.
    #[command(name = "load_IP_data")]
    LoadIpData {
        /// Attribute file: `<ip> <key> <value> ...` rows, or a `# <key> ...`
        /// header followed by `<ip> <value> ...` rows
        attr_file: PathBuf,
    },
    /// Assign pops to the loaded links
    #[command(name = "assign_pops")]
    AssignPops {
        /// Reprocess all pop assignments from scratch
        #[arg(long)]
        reset: bool,
        /// Process links that were skipped in the initial run
        #[arg(long = "process_failed")]
        process_failed: bool,
        /// ASN/country lookup table (for PoP country codes)
        #[arg(long, value_name = "FILE")]
        geoipdb: Option<PathBuf>,
    },
    /// Process queued PoP joins
    #[command(name = "process_joins")]
    ProcessJoins {
        /// Write the joins performed to this file
        #[arg(long = "log_joins", value_name = "LOG_FILE")]
        log_joins: Option<PathBuf>,
    },
    /// Remove all PoP related info from the store (but not the IP data)
    Cleanup {
        /// Remove ip links as well
        #[arg(long)]
        ip_links: bool,
    },
}

#[derive(Subcommand)]
pub enum GraphCommand {
    /// Create a graph
    Create {
        /// Reload the data from the store, storing the GraphML
        /// intermediary representation in FILENAME
        #[arg(
            long,
            value_name = "FILENAME",
            conflicts_with = "xml",
            required_unless_present = "xml"
        )]
        reload: Option<PathBuf>,
        /// Load the intermediary graph from the GraphML file FILENAME
        #[arg(long, value_name = "FILENAME")]
        xml: Option<PathBuf>,
        /// Save output with this prefix
        #[arg(long, value_name = "PREFIX", required = true)]
        save: PathBuf,
        /// JSON list of relay descriptors with at least `relay_ip`, `pop`,
        /// and `asn` per entry
        #[arg(long = "tor_relays", value_name = "RELAY_FILE", required = true)]
        tor_relays: PathBuf,
        /// The number of clients to attach
        #[arg(short = 'c', long = "num_clients", requires = "client_data")]
        num_clients: Option<usize>,
        /// File containing client data
        #[arg(long = "client_data", value_name = "CLIENT_DATAFILE", requires = "num_clients")]
        client_data: Option<PathBuf>,
        /// The number of destinations to attach, drawn from the embedded
        /// destination list
        #[arg(short = 'd', long = "num_dests")]
        num_dests: Option<usize>,
        /// Shortest-path workers
        #[arg(long, default_value_t = 2)]
        workers: usize,
        /// Log output here instead of the console
        #[arg(long, value_name = "<log file>")]
        log: Option<PathBuf>,
    },
    /// Cleanup any extraneous graph keys in the store
    Cleanup,
}
