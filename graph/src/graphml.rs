// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! GraphML read/write for the topology, plus the DOT and vertices dumps.
//!
//! The GraphML here is deliberately plain: one `<key>` per attribute name,
//! string-typed values, sets comma-joined, non-ASCII stripped. The reader
//! accepts anything the writer produces (the `--xml` reload path).

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use tracing::warn;

use crate::GraphError;
use crate::topo::TopoGraph;
use crate::vertex::{EdgeLink, Latency, NodeKind, Vertex, VertexList};

const GRAPHML_NS: &str = "http://graphml.graphdrawing.org/xmlns";

fn xml_err(e: impl std::fmt::Display) -> GraphError {
    GraphError::Xml(e.to_string())
}

fn ascii(value: &str) -> String {
    value.chars().filter(char::is_ascii).collect()
}

/// Write the graph as GraphML.
pub fn write_graphml(graph: &TopoGraph, out: impl Write) -> Result<(), GraphError> {
    let mut writer = Writer::new_with_indent(out, b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;

    let mut graphml = BytesStart::new("graphml");
    graphml.push_attribute(("xmlns", GRAPHML_NS));
    writer.write_event(Event::Start(graphml)).map_err(xml_err)?;

    // one string-typed key per attribute name in use
    let mut node_attrs: BTreeSet<String> = BTreeSet::new();
    for vertex in graph.vertices().iter() {
        node_attrs.extend(vertex.attrs().map(|(name, _)| name.to_owned()));
    }
    for name in &node_attrs {
        let mut key = BytesStart::new("key");
        key.push_attribute(("id", name.as_str()));
        key.push_attribute(("for", "node"));
        key.push_attribute(("attr.name", name.as_str()));
        key.push_attribute(("attr.type", "string"));
        writer.write_event(Event::Empty(key)).map_err(xml_err)?;
    }
    let mut key = BytesStart::new("key");
    key.push_attribute(("id", "latency"));
    key.push_attribute(("for", "edge"));
    key.push_attribute(("attr.name", "latency"));
    key.push_attribute(("attr.type", "string"));
    writer.write_event(Event::Empty(key)).map_err(xml_err)?;

    let mut g = BytesStart::new("graph");
    g.push_attribute(("id", "G"));
    g.push_attribute(("edgedefault", "undirected"));
    writer.write_event(Event::Start(g)).map_err(xml_err)?;

    for vertex in graph.vertices().iter() {
        let mut node = BytesStart::new("node");
        node.push_attribute(("id", ascii(&vertex.id).as_str()));
        writer.write_event(Event::Start(node)).map_err(xml_err)?;
        for (name, value) in vertex.attrs() {
            write_data(&mut writer, name, &ascii(&value))?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("node")))
            .map_err(xml_err)?;
    }

    for (a, b, latency) in graph.edges() {
        let mut edge = BytesStart::new("edge");
        edge.push_attribute(("source", ascii(a).as_str()));
        edge.push_attribute(("target", ascii(b).as_str()));
        writer.write_event(Event::Start(edge)).map_err(xml_err)?;
        write_data(&mut writer, "latency", &latency.to_attr())?;
        writer
            .write_event(Event::End(BytesEnd::new("edge")))
            .map_err(xml_err)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("graph")))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new("graphml")))
        .map_err(xml_err)?;
    Ok(())
}

fn write_data<W: Write>(
    writer: &mut Writer<W>,
    key: &str,
    value: &str,
) -> Result<(), GraphError> {
    let mut data = BytesStart::new("data");
    data.push_attribute(("key", key));
    writer.write_event(Event::Start(data)).map_err(xml_err)?;
    writer
        .write_event(Event::Text(BytesText::new(value)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new("data")))
        .map_err(xml_err)?;
    Ok(())
}

/// Read a graph previously written by [`write_graphml`].
pub fn read_graphml(content: &str) -> Result<TopoGraph, GraphError> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut vertices = VertexList::new();
    let mut edges: Vec<EdgeLink> = Vec::new();

    let mut node: Option<(String, BTreeMap<String, String>)> = None;
    let mut edge: Option<(String, String, BTreeMap<String, String>)> = None;
    let mut data_key: Option<String> = None;

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => match e.name().as_ref() {
                b"node" => {
                    let id = attr_value(&e, b"id")?
                        .ok_or_else(|| GraphError::Xml("node without id".to_owned()))?;
                    node = Some((id, BTreeMap::new()));
                }
                b"edge" => {
                    let source = attr_value(&e, b"source")?
                        .ok_or_else(|| GraphError::Xml("edge without source".to_owned()))?;
                    let target = attr_value(&e, b"target")?
                        .ok_or_else(|| GraphError::Xml("edge without target".to_owned()))?;
                    edge = Some((source, target, BTreeMap::new()));
                }
                b"data" => {
                    data_key = attr_value(&e, b"key")?;
                }
                _ => {}
            },
            // self-closing node: no attributes to collect
            Event::Empty(e) => {
                if e.name().as_ref() == b"node" {
                    let id = attr_value(&e, b"id")?
                        .ok_or_else(|| GraphError::Xml("node without id".to_owned()))?;
                    vertices.add(vertex_from_attrs(id, BTreeMap::new()))?;
                }
            }
            Event::Text(t) => {
                if let Some(key) = &data_key {
                    let value = t.unescape().map_err(xml_err)?.into_owned();
                    if let Some((_, attrs)) = node.as_mut() {
                        attrs.insert(key.clone(), value);
                    } else if let Some((_, _, attrs)) = edge.as_mut() {
                        attrs.insert(key.clone(), value);
                    }
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"data" => data_key = None,
                b"node" => {
                    if let Some((id, attrs)) = node.take() {
                        vertices.add(vertex_from_attrs(id, attrs))?;
                    }
                }
                b"edge" => {
                    if let Some((source, target, attrs)) = edge.take() {
                        match attrs.get("latency").and_then(|v| Latency::parse(v)) {
                            Some(latency) => edges.push(EdgeLink::new(source, target, latency)),
                            None => {
                                warn!("edge {source} -- {target} has no parsable latency, skipping");
                            }
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(TopoGraph::new(vertices, edges))
}

fn attr_value(e: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>, GraphError> {
    for attr in e.attributes() {
        let attr = attr.map_err(xml_err)?;
        if attr.key.as_ref() == name {
            return Ok(Some(attr.unescape_value().map_err(xml_err)?.into_owned()));
        }
    }
    Ok(None)
}

fn vertex_from_attrs(id: String, mut attrs: BTreeMap<String, String>) -> Vertex {
    let kind = attrs
        .remove("nodetype")
        .and_then(|k| NodeKind::parse(&k))
        .unwrap_or(NodeKind::Pop);
    let mut vertex = Vertex::new(id, kind);
    if let Some(asn) = attrs.remove("asn") {
        vertex.asn = Some(asn);
    }
    if let Some(countries) = attrs.remove("countries") {
        vertex.countries = countries
            .split(',')
            .filter(|c| !c.is_empty())
            .map(str::to_owned)
            .collect();
    }
    if let Some(url) = attrs.remove("url") {
        vertex.url = Some(url);
    }
    vertex.extra = attrs;
    vertex
}

/// Plain-text dump of every vertex and its attributes, one per line.
pub fn write_vertices(vertices: &VertexList, mut out: impl Write) -> Result<(), GraphError> {
    for vertex in vertices.iter() {
        write!(out, "{}", vertex.id)?;
        for (name, value) in vertex.attrs() {
            write!(out, " {name}={value}")?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Best-effort DOT rendering of the graph.
pub fn write_dot(graph: &TopoGraph, mut out: impl Write) -> Result<(), GraphError> {
    writeln!(out, "graph topology {{")?;
    for vertex in graph.vertices().iter() {
        writeln!(
            out,
            "  \"{}\" [nodetype=\"{}\"];",
            ascii(&vertex.id),
            vertex.kind.as_str()
        )?;
    }
    for (a, b, latency) in graph.edges() {
        writeln!(
            out,
            "  \"{}\" -- \"{}\" [latency=\"{}\"];",
            ascii(a),
            ascii(b),
            latency.to_attr()
        )?;
    }
    writeln!(out, "}}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_graph() -> TopoGraph {
        let mut vertices = VertexList::new();
        vertices
            .add(
                Vertex::new("1", NodeKind::Pop)
                    .with_asn("100")
                    .with_countries(["US".to_string(), "DE".to_string()]),
            )
            .unwrap();
        vertices
            .add(Vertex::new("dest_9_0_0_1", NodeKind::Dest).with_url("exämple.com"))
            .unwrap();
        TopoGraph::new(
            vertices,
            vec![EdgeLink::new(
                "1",
                "dest_9_0_0_1",
                Latency::Deciles([1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0]),
            )],
        )
    }

    #[test]
    fn round_trip_preserves_structure() {
        let graph = sample_graph();
        let mut buf = Vec::new();
        write_graphml(&graph, &mut buf).unwrap();
        let xml = String::from_utf8(buf).unwrap();

        let reread = read_graphml(&xml).unwrap();
        assert_eq!(reread.node_count(), 2);
        assert_eq!(reread.edge_count(), 1);
        let pop = reread.vertex("1").unwrap();
        assert_eq!(pop.kind, NodeKind::Pop);
        assert_eq!(pop.asn.as_deref(), Some("100"));
        assert_eq!(
            pop.countries.iter().cloned().collect::<Vec<_>>(),
            vec!["DE", "US"]
        );
        assert_eq!(
            reread.edge("1", "dest_9_0_0_1"),
            Some(&Latency::Deciles([
                1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0
            ]))
        );
    }

    #[test]
    fn non_ascii_is_stripped() {
        let graph = sample_graph();
        let mut buf = Vec::new();
        write_graphml(&graph, &mut buf).unwrap();
        let xml = String::from_utf8(buf).unwrap();
        assert!(xml.contains("exmple.com"));
        assert!(!xml.contains('ä'));
    }

    #[test]
    fn sets_are_comma_joined() {
        let graph = sample_graph();
        let mut buf = Vec::new();
        write_graphml(&graph, &mut buf).unwrap();
        let xml = String::from_utf8(buf).unwrap();
        assert!(xml.contains("DE,US"));
    }

    #[test]
    fn vertices_dump_lists_attributes() {
        let graph = sample_graph();
        let mut buf = Vec::new();
        write_vertices(graph.vertices(), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("1 nodetype=pop asn=100 countries=DE,US"));
        assert!(text.contains("dest_9_0_0_1 nodetype=dest"));
    }

    #[test]
    fn dot_output_names_both_endpoints() {
        let graph = sample_graph();
        let mut buf = Vec::new();
        write_dot(&graph, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("graph topology {"));
        assert!(text.contains("\"1\" -- \"dest_9_0_0_1\""));
    }
}
