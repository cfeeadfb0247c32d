// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Parser for one traceroute block in `sc_warts2text` form:
//!
//! ```text
//! traceroute from 129.186.1.240 to 184.66.242.2
//! 1  129.186.6.251  0.235 ms
//! 2  129.186.254.131  0.787 ms
//! 3  *
//! 4  192.245.179.166  0.318 ms
//! ```
//!
//! The source address is hop 0 with cumulative delay 0. Hops with `*` or
//! otherwise malformed fields are skipped; the trace still stands because
//! the surviving hops carry absolute delays.

use std::net::Ipv4Addr;

use tracing::debug;

/// Cumulative delays beyond this are measurement artifacts; the final hop
/// is dropped and reported instead of emitted.
const MAX_FINAL_DELAY_MS: f64 = 800.0;

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    /// The block contained no lines at all. Callers reset their
    /// accumulator and move on.
    #[error("trace block is empty")]
    EmptyTrace,
}

/// One hop with its cumulative delay from the source.
#[derive(Clone, Debug, PartialEq)]
pub struct Hop {
    pub ip: String,
    pub delay_ms: f64,
}

/// An adjacent-hop observation: `delay_ms` is the (sanitized) difference
/// of cumulative delays.
#[derive(Clone, Debug, PartialEq)]
pub struct LinkPair {
    pub prev: String,
    pub next: String,
    pub delay_ms: f64,
}

/// Output of parsing one block.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedTrace {
    pub pairs: Vec<LinkPair>,
    /// Final hop removed for exceeding [`MAX_FINAL_DELAY_MS`], if any.
    pub removed: Option<Hop>,
}

/// An address is usable iff it parses as a dotted quad with a non-zero
/// first octet and is neither loopback nor RFC1918 space.
fn usable_ip(field: &str) -> Option<Ipv4Addr> {
    let ip: Ipv4Addr = field.parse().ok()?;
    if ip.octets()[0] == 0 || ip.is_loopback() || ip.is_private() {
        return None;
    }
    Some(ip)
}

/// Parse a whole block given as one string. Convenience over [`parse_lines`].
pub fn parse_str(block: &str) -> Result<ParsedTrace, ParseError> {
    parse_lines(block.lines())
}

/// Parse one traceroute block. The first line must be the header; numbered
/// hop lines follow.
pub fn parse_lines<'a, I>(lines: I) -> Result<ParsedTrace, ParseError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut hops: Vec<Hop> = Vec::new();
    let mut seen_any = false;

    for (idx, line) in lines.into_iter().enumerate() {
        seen_any = true;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if idx == 0 {
            // header: "traceroute from <src> to <dst>"
            match fields.get(2).copied().and_then(usable_ip) {
                Some(ip) => hops.push(Hop {
                    ip: ip.to_string(),
                    delay_ms: 0.0,
                }),
                None => debug!("trace source unusable, continuing without hop 0: [{line}]"),
            }
            continue;
        }
        // hop: "<n>  <ip>  <delay> ms" -- '*' and malformed hops are skipped
        let Some(ip) = fields.get(1).copied().and_then(usable_ip) else {
            continue;
        };
        let Some(delay_ms) = fields.get(2).and_then(|f| f.parse::<f64>().ok()) else {
            continue;
        };
        hops.push(Hop {
            ip: ip.to_string(),
            delay_ms,
        });
    }

    if !seen_any {
        return Err(ParseError::EmptyTrace);
    }

    let mut trace = ParsedTrace::default();
    if let Some(last) = hops.last() {
        if last.delay_ms > MAX_FINAL_DELAY_MS {
            trace.removed = hops.pop();
        }
    }

    sanitize(&mut hops);

    for window in 1..hops.len() {
        let (prev, next) = (&hops[window - 1], &hops[window]);
        if prev.ip == next.ip {
            continue;
        }
        let mut delay_ms = round3(next.delay_ms - prev.delay_ms);
        if delay_ms == 0.0 {
            delay_ms = 1.0;
        }
        trace.pairs.push(LinkPair {
            prev: prev.ip.clone(),
            next: next.ip.clone(),
            delay_ms,
        });
    }

    Ok(trace)
}

/// Rewrite cumulative delays so they are monotone non-decreasing toward the
/// destination, modulo noise. Sliding triples `(A, B, C)` are visited from
/// the destination end backward, so a corrected hop is seen corrected by
/// the next triple:
///
/// - `delay(B) > delay(C)` and `delay(A) > delay(C)`: `delay(B) = delay(C)`
/// - `delay(B) > delay(C)` and `delay(A) <= delay(C)`:
///   `delay(B) = (delay(C) + delay(A)) / 2`
fn sanitize(hops: &mut [Hop]) {
    for i in (2..hops.len()).rev() {
        let c = hops[i].delay_ms;
        let b = hops[i - 1].delay_ms;
        let a = hops[i - 2].delay_ms;
        if b > c {
            hops[i - 1].delay_ms = if a > c { c } else { (c + a) / 2.0 };
        }
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pairs(block: &str) -> Vec<(String, String, f64)> {
        parse_str(block)
            .unwrap()
            .pairs
            .into_iter()
            .map(|p| (p.prev, p.next, p.delay_ms))
            .collect()
    }

    #[test]
    fn empty_block_is_an_empty_trace() {
        assert!(matches!(parse_lines([]), Err(ParseError::EmptyTrace)));
    }

    #[test]
    fn simple_trace() {
        let got = pairs(
            "traceroute from 9.0.0.1 to 7.0.0.9\n\
             1  9.0.0.2  0.5 ms\n\
             2  7.0.0.9  1.5 ms\n",
        );
        assert_eq!(
            got,
            vec![
                ("9.0.0.1".to_string(), "9.0.0.2".to_string(), 0.5),
                ("9.0.0.2".to_string(), "7.0.0.9".to_string(), 1.0),
            ]
        );
    }

    #[test]
    fn star_and_malformed_hops_are_skipped() {
        let got = pairs(
            "traceroute from 9.0.0.1 to 7.0.0.9\n\
             1  *\n\
             2  9.0.0.2  0.5 ms\n\
             garbage line\n\
             4  7.0.0.9  1.5 ms\n",
        );
        assert_eq!(got.len(), 2);
        assert_eq!(got[1].2, 1.0);
    }

    #[test]
    fn private_and_leading_zero_hops_are_skipped() {
        let got = pairs(
            "traceroute from 9.0.0.1 to 7.0.0.9\n\
             1  10.0.0.1  0.1 ms\n\
             2  192.168.1.1  0.2 ms\n\
             3  172.20.3.4  0.3 ms\n\
             4  127.0.0.1  0.4 ms\n\
             5  0.1.2.3  0.5 ms\n\
             6  9.0.0.2  0.5 ms\n",
        );
        assert_eq!(
            got,
            vec![("9.0.0.1".to_string(), "9.0.0.2".to_string(), 0.5)]
        );
    }

    #[test]
    fn unusable_source_still_yields_hop_pairs() {
        let got = pairs(
            "traceroute from 192.168.0.1 to 7.0.0.9\n\
             1  9.0.0.2  0.5 ms\n\
             2  7.0.0.9  1.5 ms\n",
        );
        assert_eq!(
            got,
            vec![("9.0.0.2".to_string(), "7.0.0.9".to_string(), 1.0)]
        );
    }

    #[test]
    fn zero_delta_becomes_one_ms() {
        let got = pairs(
            "traceroute from 9.0.0.1 to 7.0.0.9\n\
             1  9.0.0.2  0.0 ms\n\
             2  7.0.0.9  0.0 ms\n",
        );
        assert_eq!(got[0].2, 1.0);
        assert_eq!(got[1].2, 1.0);
    }

    #[test]
    fn repeated_hop_ip_is_collapsed_out() {
        let got = pairs(
            "traceroute from 9.0.0.1 to 7.0.0.9\n\
             1  9.0.0.2  0.5 ms\n\
             2  9.0.0.2  0.7 ms\n\
             3  7.0.0.9  1.5 ms\n",
        );
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].0, "9.0.0.1");
        assert_eq!(got[0].1, "9.0.0.2");
        assert_eq!(got[1].0, "9.0.0.2");
        assert_eq!(got[1].1, "7.0.0.9");
    }

    #[test]
    fn slow_final_hop_is_removed_and_reported() {
        let trace = parse_str(
            "traceroute from 9.0.0.1 to 7.0.0.9\n\
             1  9.0.0.2  0.5 ms\n\
             2  7.0.0.9  801.0 ms\n",
        )
        .unwrap();
        assert_eq!(
            trace.removed,
            Some(Hop {
                ip: "7.0.0.9".to_string(),
                delay_ms: 801.0
            })
        );
        assert_eq!(trace.pairs.len(), 1);
    }

    #[test]
    fn sanitize_pulls_spikes_down() {
        // A=1.0, B=5.0, C=2.0: A <= C, so B becomes (2.0 + 1.0) / 2 = 1.5
        let mut hops = vec![
            Hop { ip: "a".into(), delay_ms: 1.0 },
            Hop { ip: "b".into(), delay_ms: 5.0 },
            Hop { ip: "c".into(), delay_ms: 2.0 },
        ];
        sanitize(&mut hops);
        assert_eq!(hops[1].delay_ms, 1.5);

        // A=3.0, B=5.0, C=2.0: A > C, so B becomes C
        let mut hops = vec![
            Hop { ip: "a".into(), delay_ms: 3.0 },
            Hop { ip: "b".into(), delay_ms: 5.0 },
            Hop { ip: "c".into(), delay_ms: 2.0 },
        ];
        sanitize(&mut hops);
        assert_eq!(hops[1].delay_ms, 2.0);
    }

    #[test]
    fn sanitized_delays_are_monotone_modulo_average_rule() {
        let trace = parse_str(
            "traceroute from 9.0.0.1 to 7.0.0.9\n\
             1  9.0.0.2  0.4 ms\n\
             2  9.0.0.3  9.0 ms\n\
             3  9.0.0.4  1.0 ms\n\
             4  7.0.0.9  2.0 ms\n",
        )
        .unwrap();
        // every emitted delta is positive after sanitization
        for pair in &trace.pairs {
            assert!(pair.delay_ms > 0.0, "{pair:?}");
        }
    }
}
