// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Graph reduction: turn the PoP multigraph accumulated in the store into
//! a minimized, overlay-attached topology.
//!
//! The stages, in order: [`LinkDict`] loads the PoP adjacency and performs
//! degree-1 trimming and latency-aware degree-2 collapsing; [`Overlay`]
//! attaches client, destination, and relay endpoints; [`builder`] wires
//! those into an in-memory [`TopoGraph`]; [`core`] keeps only edges on
//! shortest valley-free paths between overlay endpoints; [`graphml`]
//! serializes the result.

#![deny(clippy::all)]

mod attach;
mod builder;
mod core;
mod graphml;
mod linkdict;
mod peering;
mod topo;
mod util;
mod vertex;

pub use crate::attach::{
    AttachStats, DEFAULT_DESTINATIONS, Overlay, RelayDescriptor, find_pop_for_asn, load_relays,
    relay_pops,
};
pub use crate::builder::{BuildOptions, load_topology};
pub use crate::core::{
    CoreOptions, CoreStats, ValleyFreeError, check_valley_free, compute_core, valley_free_path,
};
pub use crate::graphml::{read_graphml, write_dot, write_graphml, write_vertices};
pub use crate::linkdict::LinkDict;
pub use crate::peering::PeeringDb;
pub use crate::topo::TopoGraph;
pub use crate::util::{EmptyListError, decile_transform};
pub use crate::vertex::{EdgeLink, Latency, NodeKind, Vertex, VertexList};

use store::StoreError;

#[derive(thiserror::Error, Debug)]
pub enum GraphError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("duplicate vertex '{0}'")]
    DuplicateVertex(String),
    #[error("no pops known for ASN {0}")]
    AsnNotKnown(String),
    #[error("column '{0}' missing from client data")]
    MissingColumn(&'static str),
    #[error("bad relay list: {0}")]
    BadRelays(String),
    #[error("client data: {0}")]
    Csv(#[from] csv::Error),
    #[error("graphml: {0}")]
    Xml(String),
    #[error("no nodes survived core reduction")]
    EmptyCore,
}
