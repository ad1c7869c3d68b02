use std::collections::BTreeMap;
use std::iter::Peekable;

use serde::Serialize;

/// Typed form of `birdc show ospf state all` output. Field names serialize
/// straight into the router-telemetry wire schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OspfState {
    pub area_routers: BTreeMap<String, Vec<RouterInfo>>,
    pub other_asbrs: Vec<RouterInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RouterInfo {
    pub router_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<u32>,
    pub vlinks: Vec<VlinkEntry>,
    pub routers: Vec<RouterEntry>,
    pub stubnets: Vec<NetworkEntry>,
    pub xnetworks: Vec<NetworkEntry>,
    pub xrouters: Vec<RouterEntry>,
    pub externals: Vec<ExternalEntry>,
    pub nssa_externals: Vec<ExternalEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VlinkEntry {
    pub peer_id: String,
    pub metric: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RouterEntry {
    pub router_id: String,
    pub metric: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkEntry {
    pub network: String,
    pub metric: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExternalEntry {
    pub network: String,
    pub metric: u32,
    /// 1 for ordinary externals, 2 when the `metric2` token is present.
    pub metric_type: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("ospf state parse error at line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

type LineIter<'a> = Peekable<std::iter::Enumerate<std::str::Lines<'a>>>;

fn err(line: usize, message: impl Into<String>) -> ParseError {
    ParseError {
        line: line + 1,
        message: message.into(),
    }
}

fn indent_of(line: &str) -> usize {
    line.chars().take_while(|c| *c == '\t').count()
}

/// Strict recursive descent over the tab-indented dump. Blank lines are
/// skipped at any depth; a line shallower than the current frame ends it.
pub fn parse_ospf_state(text: &str) -> Result<OspfState, ParseError> {
    let mut lines: LineIter = text.lines().enumerate().peekable();
    let mut state = OspfState::default();

    while let Some(&(no, raw)) = lines.peek() {
        if raw.trim().is_empty() {
            lines.next();
            continue;
        }
        if indent_of(raw) != 0 {
            return Err(err(no, "expected top-level 'area' or 'other ASBRs'"));
        }
        let trimmed = raw.trim();
        if let Some(area) = trimmed.strip_prefix("area ") {
            lines.next();
            let routers = parse_routers(&mut lines, 1)?;
            state.area_routers.insert(area.trim().to_string(), routers);
        } else if trimmed == "other ASBRs" {
            lines.next();
            state.other_asbrs = parse_routers(&mut lines, 1)?;
        } else {
            return Err(err(no, format!("unrecognized top-level line '{}'", trimmed)));
        }
    }

    Ok(state)
}

fn parse_routers(lines: &mut LineIter, depth: usize) -> Result<Vec<RouterInfo>, ParseError> {
    let mut routers = Vec::new();
    while let Some(&(no, raw)) = lines.peek() {
        if raw.trim().is_empty() {
            lines.next();
            continue;
        }
        let indent = indent_of(raw);
        if indent < depth {
            break;
        }
        if indent > depth {
            return Err(err(no, "unexpected indent inside area"));
        }
        let trimmed = raw.trim();
        let router_id = trimmed
            .strip_prefix("router ")
            .ok_or_else(|| err(no, format!("expected 'router <id>', got '{}'", trimmed)))?;
        lines.next();
        let mut info = RouterInfo {
            router_id: router_id.trim().to_string(),
            ..RouterInfo::default()
        };
        parse_router_entries(lines, depth + 1, &mut info)?;
        routers.push(info);
    }
    Ok(routers)
}

fn parse_router_entries(
    lines: &mut LineIter,
    depth: usize,
    info: &mut RouterInfo,
) -> Result<(), ParseError> {
    while let Some(&(no, raw)) = lines.peek() {
        if raw.trim().is_empty() {
            lines.next();
            continue;
        }
        let indent = indent_of(raw);
        if indent < depth {
            break;
        }
        if indent > depth {
            return Err(err(no, "unexpected indent inside router"));
        }
        let tokens: Vec<&str> = raw.trim().split_whitespace().collect();
        let kind = tokens[0];
        match kind {
            "distance" => {
                info.distance = Some(parse_number(&tokens, 1, no)?);
            }
            "vlink" => info.vlinks.push(VlinkEntry {
                peer_id: token_at(&tokens, 1, no)?.to_string(),
                metric: parse_metric_opts(&tokens[2..]).0,
            }),
            "router" => info.routers.push(RouterEntry {
                router_id: token_at(&tokens, 1, no)?.to_string(),
                metric: parse_metric_opts(&tokens[2..]).0,
            }),
            "stubnet" => info.stubnets.push(NetworkEntry {
                network: token_at(&tokens, 1, no)?.to_string(),
                metric: parse_metric_opts(&tokens[2..]).0,
            }),
            "xnetwork" => info.xnetworks.push(NetworkEntry {
                network: token_at(&tokens, 1, no)?.to_string(),
                metric: parse_metric_opts(&tokens[2..]).0,
            }),
            "xrouter" => info.xrouters.push(RouterEntry {
                router_id: token_at(&tokens, 1, no)?.to_string(),
                metric: parse_metric_opts(&tokens[2..]).0,
            }),
            "external" => info.externals.push(parse_external(&tokens, no)?),
            "nssa-ext" => info.nssa_externals.push(parse_external(&tokens, no)?),
            other => return Err(err(no, format!("unknown entry kind '{}'", other))),
        }
        lines.next();
    }
    Ok(())
}

fn token_at<'a>(tokens: &[&'a str], index: usize, line: usize) -> Result<&'a str, ParseError> {
    tokens
        .get(index)
        .copied()
        .ok_or_else(|| err(line, "truncated entry line"))
}

fn parse_number(tokens: &[&str], index: usize, line: usize) -> Result<u32, ParseError> {
    token_at(tokens, index, line)?
        .parse()
        .map_err(|_| err(line, format!("expected a number at position {}", index)))
}

/// Scan the option tail of an entry: `metric <n>` sets the value, a bare
/// `metric2` token marks type 2, `via`/`tag` take the following token.
fn parse_metric_opts(tokens: &[&str]) -> (u32, u8, Option<String>, Option<String>) {
    let mut metric = 0;
    let mut metric_type = 1;
    let mut via = None;
    let mut tag = None;
    let mut iter = tokens.iter().peekable();
    while let Some(token) = iter.next() {
        match *token {
            "metric" => {
                if let Some(value) = iter.next().and_then(|v| v.parse().ok()) {
                    metric = value;
                }
            }
            "metric2" => metric_type = 2,
            "via" => via = iter.next().map(|v| v.to_string()),
            "tag" => tag = iter.next().map(|v| v.to_string()),
            _ => {}
        }
    }
    (metric, metric_type, via, tag)
}

fn parse_external(tokens: &[&str], line: usize) -> Result<ExternalEntry, ParseError> {
    let network = token_at(tokens, 1, line)?.to_string();
    let (metric, metric_type, via, tag) = parse_metric_opts(&tokens[2..]);
    Ok(ExternalEntry {
        network,
        metric,
        metric_type,
        via,
        tag,
    })
}

/// Re-emit the parsed tree in the dump's own shape. Exists so the parser's
/// fidelity can be checked by a parse → render → parse round trip.
pub fn render_ospf_state(state: &OspfState) -> String {
    let mut out = String::new();
    for (area, routers) in &state.area_routers {
        out.push_str(&format!("area {}\n", area));
        render_routers(&mut out, routers);
    }
    if !state.other_asbrs.is_empty() {
        out.push_str("other ASBRs\n");
        render_routers(&mut out, &state.other_asbrs);
    }
    out
}

fn render_routers(out: &mut String, routers: &[RouterInfo]) {
    for router in routers {
        out.push_str(&format!("\trouter {}\n", router.router_id));
        if let Some(distance) = router.distance {
            out.push_str(&format!("\t\tdistance {}\n", distance));
        }
        for v in &router.vlinks {
            out.push_str(&format!("\t\tvlink {} metric {}\n", v.peer_id, v.metric));
        }
        for r in &router.routers {
            out.push_str(&format!("\t\trouter {} metric {}\n", r.router_id, r.metric));
        }
        for s in &router.stubnets {
            out.push_str(&format!("\t\tstubnet {} metric {}\n", s.network, s.metric));
        }
        for x in &router.xnetworks {
            out.push_str(&format!("\t\txnetwork {} metric {}\n", x.network, x.metric));
        }
        for x in &router.xrouters {
            out.push_str(&format!("\t\txrouter {} metric {}\n", x.router_id, x.metric));
        }
        for e in &router.externals {
            out.push_str(&format!("\t\texternal {}\n", render_external(e)));
        }
        for e in &router.nssa_externals {
            out.push_str(&format!("\t\tnssa-ext {}\n", render_external(e)));
        }
    }
}

fn render_external(e: &ExternalEntry) -> String {
    let mut line = format!("{} metric {}", e.network, e.metric);
    if e.metric_type == 2 {
        line.push_str(" metric2");
    }
    if let Some(via) = &e.via {
        line.push_str(&format!(" via {}", via));
    }
    if let Some(tag) = &e.tag {
        line.push_str(&format!(" tag {}", tag));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = "area 0.0.0.0\n\
\trouter 1.1.1.1\n\
\t\tdistance 10\n\
\t\tstubnet 10.0.0.0/30 metric 100\n\
\t\texternal 0.0.0.0/0 metric 20 metric2 via 1.1.1.2 tag 7\n";

    #[test]
    fn parses_the_reference_fixture() {
        let state = parse_ospf_state(FIXTURE).unwrap();
        let routers = &state.area_routers["0.0.0.0"];
        assert_eq!(routers.len(), 1);
        let r = &routers[0];
        assert_eq!(r.router_id, "1.1.1.1");
        assert_eq!(r.distance, Some(10));
        assert_eq!(
            r.stubnets,
            vec![NetworkEntry {
                network: "10.0.0.0/30".to_string(),
                metric: 100
            }]
        );
        assert_eq!(
            r.externals,
            vec![ExternalEntry {
                network: "0.0.0.0/0".to_string(),
                metric: 20,
                metric_type: 2,
                via: Some("1.1.1.2".to_string()),
                tag: Some("7".to_string()),
            }]
        );
        assert!(state.other_asbrs.is_empty());
    }

    #[test]
    fn parses_multiple_areas_routers_and_asbrs() {
        let text = "area 0.0.0.0\n\
\trouter 1.1.1.1\n\
\t\trouter 2.2.2.2 metric 10\n\
\t\tvlink 3.3.3.3 metric 5\n\
\trouter 2.2.2.2\n\
\t\txnetwork 10.1.0.0/24 metric 30\n\
\t\txrouter 9.9.9.9 metric 12\n\
area 0.0.0.1\n\
\trouter 4.4.4.4\n\
\t\tnssa-ext 172.16.0.0/16 metric 40 tag 99\n\
other ASBRs\n\
\trouter 5.5.5.5\n";
        let state = parse_ospf_state(text).unwrap();
        assert_eq!(state.area_routers.len(), 2);
        assert_eq!(state.area_routers["0.0.0.0"].len(), 2);
        let first = &state.area_routers["0.0.0.0"][0];
        assert_eq!(first.routers[0].router_id, "2.2.2.2");
        assert_eq!(first.vlinks[0].metric, 5);
        let nssa = &state.area_routers["0.0.0.1"][0].nssa_externals[0];
        assert_eq!(nssa.metric_type, 1);
        assert_eq!(nssa.tag.as_deref(), Some("99"));
        assert_eq!(state.other_asbrs[0].router_id, "5.5.5.5");
    }

    #[test]
    fn blank_lines_are_skipped_at_any_depth() {
        let text = "area 0.0.0.0\n\n\trouter 1.1.1.1\n\n\t\tdistance 3\n\n";
        let state = parse_ospf_state(text).unwrap();
        assert_eq!(state.area_routers["0.0.0.0"][0].distance, Some(3));
    }

    #[test]
    fn rejects_malformed_structure() {
        assert!(parse_ospf_state("\trouter 1.1.1.1\n").is_err());
        assert!(parse_ospf_state("area 0\n\tdistance 1\n").is_err());
        assert!(parse_ospf_state("area 0\n\trouter 1.1.1.1\n\t\tbogus 1\n").is_err());
    }

    #[test]
    fn parse_render_parse_round_trips_every_entry_kind() {
        let text = "area 0.0.0.0\n\
\trouter 1.1.1.1\n\
\t\tdistance 10\n\
\t\tvlink 3.3.3.3 metric 5\n\
\t\trouter 2.2.2.2 metric 10\n\
\t\tstubnet 10.0.0.0/30 metric 100\n\
\t\txnetwork 10.1.0.0/24 metric 30\n\
\t\txrouter 9.9.9.9 metric 12\n\
\t\texternal 0.0.0.0/0 metric 20 metric2 via 1.1.1.2 tag 7\n\
\t\tnssa-ext 172.16.0.0/16 metric 40 tag 99\n\
other ASBRs\n\
\trouter 5.5.5.5\n\
\t\tdistance 7\n";
        let first = parse_ospf_state(text).unwrap();
        let rendered = render_ospf_state(&first);
        let second = parse_ospf_state(&rendered).unwrap();
        assert_eq!(first, second);
        assert_eq!(rendered, text);
    }
}
