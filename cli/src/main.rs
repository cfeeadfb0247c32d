// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The popmap binary: wires the pipeline stages to the CLI surface.
//!
//! Construction happens once here: the store, the ASN lookup, and the
//! interrupt flag are built at entry and handed to components by
//! reference.

#![deny(clippy::all)]

mod args;

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info, warn};

use assign::{AssignOptions, POPJOIN_MUTEX, PopAssigner, PopJoiner};
use graph::{BuildOptions, CoreOptions, compute_core, load_relays, load_topology, read_graphml,
    write_dot, write_graphml, write_vertices};
use store::{MemStore, Store, StoreMutex, keys};
use trace::{AsnLookup, LinkIngest, TableAsnLookup, load_ip_attributes, parse_lines};

use crate::args::{Cmdline, Command, GraphCommand, ProcessCommand};

fn main() -> anyhow::Result<()> {
    let args = Cmdline::parse();
    init_tracing(&args)?;

    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = interrupt.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    })
    .context("installing interrupt handler")?;

    let store = MemStore::open(&args.db)
        .with_context(|| format!("opening store snapshot {}", args.db.display()))?;

    match args.command {
        Command::Process(cmd) => run_process(&store, cmd, &interrupt)?,
        Command::Graph(cmd) => run_graph(&store, cmd, &interrupt)?,
    }

    store.flush().context("flushing store snapshot")?;
    Ok(())
}

/// Route log output to `--log` for `graph create`, the console otherwise.
fn init_tracing(args: &Cmdline) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false);
    if let Command::Graph(GraphCommand::Create { log: Some(path), .. }) = &args.command {
        let file = File::create(path)
            .with_context(|| format!("creating log file {}", path.display()))?;
        builder.with_ansi(false).with_writer(Arc::new(file)).init();
    } else {
        builder.init();
    }
    Ok(())
}

fn run_process(
    store: &dyn Store,
    cmd: ProcessCommand,
    interrupt: &AtomicBool,
) -> anyhow::Result<()> {
    match cmd {
        ProcessCommand::Parse { geoipdb, trace } => {
            let lookup = TableAsnLookup::from_path(&geoipdb)
                .with_context(|| format!("loading ASN table {}", geoipdb.display()))?;
            walk_trace_file(&trace, interrupt, |pairs| {
                let mutex = StoreMutex::new(store, POPJOIN_MUTEX);
                if mutex.is_locked()? {
                    debug!("waiting for popjoin lock");
                    mutex.wait()?;
                }
                LinkIngest::new(store, &lookup).ingest(pairs)?;
                Ok(())
            })?;
        }
        ProcessCommand::PreprocessTraces { geoipdb, tracefiles } => {
            let lookup = TableAsnLookup::from_path(&geoipdb)
                .with_context(|| format!("loading ASN table {}", geoipdb.display()))?;
            let mut ips: HashSet<String> = HashSet::new();
            for file in &tracefiles {
                walk_trace_file(file, interrupt, |pairs| {
                    for pair in pairs {
                        ips.insert(pair.prev.clone());
                        ips.insert(pair.next.clone());
                    }
                    Ok(())
                })?;
            }
            info!("resolving ASNs for {} IPs", ips.len());
            for ip in &ips {
                let ip_key = keys::ip(ip);
                if store.hget(&ip_key, "asn")?.is_none() {
                    let asn = lookup.org_by_addr(ip).unwrap_or_else(|| "N/A".to_string());
                    store.hset(&ip_key, "asn", &asn)?;
                }
                store.sadd(keys::IPLIST, ip)?;
            }
        }
        ProcessCommand::DumpIps { trace } => {
            let mut seen: HashSet<String> = HashSet::new();
            walk_trace_file(&trace, interrupt, |pairs| {
                for pair in pairs {
                    for ip in [&pair.prev, &pair.next] {
                        if seen.insert(ip.clone()) {
                            println!("{ip}");
                        }
                    }
                }
                Ok(())
            })?;
        }
        ProcessCommand::LoadIpData { attr_file } => {
            let reader = BufReader::new(
                File::open(&attr_file)
                    .with_context(|| format!("opening {}", attr_file.display()))?,
            );
            let loaded = load_ip_attributes(store, reader)?;
            info!("loaded attributes for {loaded} IPs");
        }
        ProcessCommand::AssignPops {
            reset,
            process_failed,
            geoipdb,
        } => {
            let lookup = match &geoipdb {
                Some(path) => TableAsnLookup::from_path(path)
                    .with_context(|| format!("loading ASN table {}", path.display()))?,
                None => TableAsnLookup::new(),
            };
            let stats = PopAssigner::new(store, &lookup)
                .with_interrupt(interrupt)
                .run(&AssignOptions {
                    reset,
                    process_failed,
                })?;
            if stats.failed > 0 {
                warn!(
                    "{} links failed; replay them with assign_pops --process_failed",
                    stats.failed
                );
            }
        }
        ProcessCommand::ProcessJoins { log_joins } => {
            let before = store.llen(keys::JOIN_HISTORY)?;
            PopJoiner::new(store).with_interrupt(interrupt).run()?;
            if let Some(path) = log_joins {
                let joined = store.lrange(keys::JOIN_HISTORY, before as isize, -1)?;
                std::fs::write(&path, joined.join("\n") + "\n")
                    .with_context(|| format!("writing {}", path.display()))?;
            }
        }
        ProcessCommand::Cleanup { ip_links } => {
            assign::cleanup_process(store, ip_links)?;
        }
    }
    Ok(())
}

fn run_graph(store: &dyn Store, cmd: GraphCommand, interrupt: &AtomicBool) -> anyhow::Result<()> {
    match cmd {
        GraphCommand::Create {
            reload,
            xml,
            save,
            tor_relays,
            num_clients,
            client_data,
            num_dests,
            workers,
            log: _,
        } => {
            let relays = load_relays(
                File::open(&tor_relays)
                    .with_context(|| format!("opening {}", tor_relays.display()))?,
            )?;
            info!("read {} relays from {}", relays.len(), tor_relays.display());

            let topology = if let Some(path) = xml {
                info!("loading saved graph from file: {}", path.display());
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                read_graphml(&content)?
            } else {
                let opts = BuildOptions {
                    num_clients,
                    client_data,
                    num_dests,
                    relays,
                    ..BuildOptions::default()
                };
                let (topology, _stats) = load_topology(store, &opts)?;
                let reload =
                    reload.unwrap_or_else(|| unreachable!("clap requires --reload without --xml"));
                let mut out = buffered(&reload)?;
                write_graphml(&topology, &mut out)?;
                out.flush()?;
                let mut verts = buffered(Path::new("vertices.dat"))?;
                write_vertices(topology.vertices(), &mut verts)?;
                verts.flush()?;
                info!("wrote intermediate graph to {}", reload.display());
                topology
            };

            let (core, stats) = compute_core(
                store,
                &topology,
                &CoreOptions::with_workers(workers),
                Some(interrupt),
            )?;
            info!(
                "core complete: {} sources, {} rebuilt paths, {} dropped pairs, {} missing relationships",
                stats.sources, stats.rebuilt_paths, stats.dropped_pairs, stats.missing_relationships
            );

            let xml_out = with_extension(&save, "xml");
            let mut out = buffered(&xml_out)?;
            write_graphml(&core, &mut out)?;
            out.flush()?;
            info!("wrote core graph to {}", xml_out.display());
            let dot_out = with_extension(&save, "dot");
            match buffered(&dot_out).and_then(|w| write_dot(&core, w).map_err(Into::into)) {
                Ok(()) => info!("wrote {}", dot_out.display()),
                Err(e) => info!("failed to write dot graph: {e}"),
            }
        }
        GraphCommand::Cleanup => {
            assign::cleanup_graph(store)?;
        }
    }
    Ok(())
}

fn with_extension(prefix: &Path, ext: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

fn buffered(path: &Path) -> anyhow::Result<BufWriter<File>> {
    Ok(BufWriter::new(File::create(path).with_context(|| {
        format!("creating {}", path.display())
    })?))
}

/// Split a trace file into traceroute blocks and hand each block's parsed
/// pairs to `sink`. Blocks that fail to parse are skipped.
fn walk_trace_file(
    path: &Path,
    interrupt: &AtomicBool,
    mut sink: impl FnMut(&[trace::LinkPair]) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    let reader = BufReader::new(
        File::open(path).with_context(|| format!("opening trace file {}", path.display()))?,
    );
    let mut block: Vec<String> = Vec::new();
    let mut traces = 0u64;

    let mut flush = |block: &[String], sink: &mut dyn FnMut(&[trace::LinkPair]) -> anyhow::Result<()>|
     -> anyhow::Result<()> {
        if block.is_empty() {
            return Ok(());
        }
        match parse_lines(block.iter().map(String::as_str)) {
            Ok(parsed) => {
                if let Some(removed) = &parsed.removed {
                    debug!("removed slow final hop {} ({} ms)", removed.ip, removed.delay_ms);
                }
                sink(&parsed.pairs)?;
            }
            Err(e) => debug!("skipping trace block: {e}"),
        }
        Ok(())
    };

    for line in reader.lines() {
        if interrupt.load(Ordering::Relaxed) {
            info!("interrupted after {traces} traces");
            return Ok(());
        }
        let line = line?;
        if line.split_whitespace().next() == Some("traceroute") {
            flush(&block, &mut sink)?;
            block.clear();
            traces += 1;
            if traces % 1000 == 0 {
                info!("processed trace: {traces}");
            }
        }
        block.push(line);
    }
    flush(&block, &mut sink)?;
    info!("processed {traces} traces from {}", path.display());
    Ok(())
}
