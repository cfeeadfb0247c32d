// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Vertex and edge records for the reduced topology.

use std::collections::{BTreeMap, BTreeSet};

use crate::GraphError;

/// What a vertex stands for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Pop,
    Relay,
    Client,
    Dest,
}

impl NodeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Pop => "pop",
            NodeKind::Relay => "relay",
            NodeKind::Client => "client",
            NodeKind::Dest => "dest",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pop" => Some(NodeKind::Pop),
            "relay" => Some(NodeKind::Relay),
            "client" => Some(NodeKind::Client),
            "dest" => Some(NodeKind::Dest),
            _ => None,
        }
    }

    /// Overlay endpoints are the sources and targets of the core
    /// shortest-path pass.
    #[must_use]
    pub fn is_overlay(self) -> bool {
        matches!(self, NodeKind::Relay | NodeKind::Client | NodeKind::Dest)
    }
}

/// Edge latency: either a plain milliseconds value or a 10-element decile
/// summary of the underlying sample distribution.
#[derive(Clone, Debug, PartialEq)]
pub enum Latency {
    Scalar(f64),
    Deciles([f64; 10]),
}

impl Latency {
    /// Single representative value: the median of the deciles, or the
    /// scalar itself.
    #[must_use]
    pub fn representative(&self) -> f64 {
        match self {
            Latency::Scalar(v) => *v,
            Latency::Deciles(d) => d[5],
        }
    }

    /// Attribute form: scalar as-is, deciles comma-joined.
    #[must_use]
    pub fn to_attr(&self) -> String {
        match self {
            Latency::Scalar(v) => v.to_string(),
            Latency::Deciles(d) => d
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    /// Inverse of [`Latency::to_attr`]. Accepts a single value or exactly
    /// ten comma-separated values.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let values: Vec<f64> = s
            .split(',')
            .map(|v| v.trim().parse().ok())
            .collect::<Option<_>>()?;
        match values.as_slice() {
            [single] => Some(Latency::Scalar(*single)),
            ten if ten.len() == 10 => {
                let mut d = [0.0; 10];
                d.copy_from_slice(ten);
                Some(Latency::Deciles(d))
            }
            _ => None,
        }
    }
}

/// One vertex of the output graph.
#[derive(Clone, Debug, PartialEq)]
pub struct Vertex {
    pub id: String,
    pub kind: NodeKind,
    pub asn: Option<String>,
    pub countries: BTreeSet<String>,
    pub url: Option<String>,
    /// Freeform attributes carried through from relay descriptors.
    pub extra: BTreeMap<String, String>,
}

impl Vertex {
    #[must_use]
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            asn: None,
            countries: BTreeSet::new(),
            url: None,
            extra: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_asn(mut self, asn: impl Into<String>) -> Self {
        self.asn = Some(asn.into());
        self
    }

    #[must_use]
    pub fn with_countries(mut self, countries: impl IntoIterator<Item = String>) -> Self {
        self.countries = countries.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Attribute pairs in stable order, the way the writers emit them.
    pub fn attrs(&self) -> impl Iterator<Item = (&str, String)> {
        let mut out: Vec<(&str, String)> = vec![("nodetype", self.kind.as_str().to_string())];
        if let Some(asn) = &self.asn {
            out.push(("asn", asn.clone()));
        }
        if !self.countries.is_empty() {
            out.push((
                "countries",
                self.countries.iter().cloned().collect::<Vec<_>>().join(","),
            ));
        }
        if let Some(url) = &self.url {
            out.push(("url", url.clone()));
        }
        for (k, v) in &self.extra {
            out.push((k.as_str(), v.clone()));
        }
        out.into_iter()
    }
}

/// Vertex set keyed by id, iterated in id order.
#[derive(Clone, Debug, Default)]
pub struct VertexList {
    map: BTreeMap<String, Vertex>,
}

impl VertexList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, vertex: Vertex) -> Result<(), GraphError> {
        if self.map.contains_key(&vertex.id) {
            return Err(GraphError::DuplicateVertex(vertex.id));
        }
        self.map.insert(vertex.id.clone(), vertex);
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.map.contains_key(id)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Vertex> {
        self.map.get(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Vertex> {
        self.map.remove(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vertex> {
        self.map.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }
}

/// One undirected edge with its latency attribute.
#[derive(Clone, Debug, PartialEq)]
pub struct EdgeLink {
    pub a: String,
    pub b: String,
    pub latency: Latency,
}

impl EdgeLink {
    #[must_use]
    pub fn new(a: impl Into<String>, b: impl Into<String>, latency: Latency) -> Self {
        Self {
            a: a.into(),
            b: b.into(),
            latency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn latency_representative() {
        assert_eq!(Latency::Scalar(4.0).representative(), 4.0);
        let d = Latency::Deciles([1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0]);
        assert_eq!(d.representative(), 6.0);
    }

    #[test]
    fn latency_attr_round_trip() {
        let d = Latency::Deciles([1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0]);
        assert_eq!(Latency::parse(&d.to_attr()), Some(d));
        let s = Latency::Scalar(2.5);
        assert_eq!(Latency::parse(&s.to_attr()), Some(s));
        assert_eq!(Latency::parse("1,2,3"), None);
        assert_eq!(Latency::parse("x"), None);
    }

    #[test]
    fn duplicate_vertices_are_rejected() {
        let mut list = VertexList::new();
        list.add(Vertex::new("a", NodeKind::Pop)).unwrap();
        assert!(matches!(
            list.add(Vertex::new("a", NodeKind::Relay)),
            Err(GraphError::DuplicateVertex(_))
        ));
    }
}
