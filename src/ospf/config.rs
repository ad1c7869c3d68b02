use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Inputs for one rendered router configuration. Maps are ordered so that
/// identical inputs always produce identical text.
#[derive(Debug, Clone, Default)]
pub struct RouterConfigSpec {
    pub router_id: Option<String>,
    pub direct_interface_names: Vec<String>,
    pub ospf_import_exclude: Vec<String>,
    pub ospf_export_exclude: Vec<String>,
    /// area id -> interface name -> per-interface OSPF settings
    pub ospf_area_config: BTreeMap<String, BTreeMap<String, OspfInterfaceConfig>>,
    pub bfd_config: BTreeMap<String, BfdInterfaceConfig>,
    pub debug_protocols: Option<String>,
    pub disable_logging: bool,
    pub git_version: Option<String>,
    /// Embedded into the header comment; callers pass a fixed value in tests.
    pub generated_at: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OspfInterfaceConfig {
    pub cost: Option<u32>,
    pub iface_type: Option<String>,
    pub auth: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BfdInterfaceConfig {
    pub interval_ms: Option<u32>,
    pub tx_ms: Option<u32>,
    pub rx_ms: Option<u32>,
    pub idle_ms: Option<u32>,
    pub multiplier: Option<u32>,
}

/// Render the BIRD OSPFv2 + BFD configuration text.
pub fn render(spec: &RouterConfigSpec) -> String {
    let mut out = String::new();

    let version = spec.git_version.as_deref().unwrap_or("unknown");
    match &spec.generated_at {
        Some(ts) => {
            let _ = writeln!(out, "# networktools router config ({}) generated {}", version, ts);
        }
        None => {
            let _ = writeln!(out, "# networktools router config ({})", version);
        }
    }

    if !spec.disable_logging {
        out.push_str("log syslog all;\n");
    }
    if let Some(protocols) = &spec.debug_protocols {
        let _ = writeln!(out, "debug protocols {};", protocols);
    }
    if let Some(router_id) = &spec.router_id {
        let _ = writeln!(out, "router id {};", router_id);
    }

    out.push_str("protocol device {\nscan time 10;\n}\n");

    if !spec.direct_interface_names.is_empty() {
        let names = spec
            .direct_interface_names
            .iter()
            .map(|n| format!("\"{}\"", n))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "protocol direct {{\nipv4;\ninterface {};\n}}", names);
    }

    render_filter(&mut out, "ospf_import", &spec.ospf_import_exclude);
    render_filter(&mut out, "ospf_export", &spec.ospf_export_exclude);

    if !spec.bfd_config.is_empty() {
        out.push_str("protocol bfd {\n");
        for (ifname, bfd) in &spec.bfd_config {
            let _ = writeln!(out, "interface \"{}\" {{", ifname);
            if let Some(ms) = bfd.interval_ms {
                let _ = writeln!(out, "interval {} ms;", ms);
            }
            if let Some(ms) = bfd.rx_ms {
                let _ = writeln!(out, "min rx interval {} ms;", ms);
            }
            if let Some(ms) = bfd.tx_ms {
                let _ = writeln!(out, "min tx interval {} ms;", ms);
            }
            if let Some(ms) = bfd.idle_ms {
                let _ = writeln!(out, "idle tx interval {} ms;", ms);
            }
            if let Some(mult) = bfd.multiplier {
                let _ = writeln!(out, "multiplier {};", mult);
            }
            out.push_str("};\n");
        }
        out.push_str("}\n");
    }

    out.push_str("protocol ospf v2 {\nipv4 {\n");
    let _ = writeln!(out, "import {};", filter_clause("ospf_import", &spec.ospf_import_exclude));
    let _ = writeln!(out, "export {};", filter_clause("ospf_export", &spec.ospf_export_exclude));
    out.push_str("};\n");

    for (area, interfaces) in &spec.ospf_area_config {
        let _ = writeln!(out, "area {} {{", area);
        for (ifname, iface) in interfaces {
            let _ = writeln!(out, "interface \"{}\" {{", ifname);
            if spec.bfd_config.contains_key(ifname) {
                out.push_str("bfd yes;\n");
            }
            if let Some(cost) = iface.cost {
                let _ = writeln!(out, "cost {};", cost);
            }
            if let Some(iface_type) = &iface.iface_type {
                let _ = writeln!(out, "type {};", iface_type);
            }
            if let Some(auth) = &iface.auth {
                out.push_str("authentication cryptographic;\n");
                let _ = writeln!(out, "password \"{}\" {{ algorithm hmac sha512; }};", auth);
            }
            out.push_str("};\n");
        }
        out.push_str("};\n");
    }
    out.push_str("}\n");

    reindent(&out)
}

/// A named CIDR set plus a filter that accepts everything outside it. An
/// empty exclude list renders no filter at all; the channel uses `all`.
fn render_filter(out: &mut String, name: &str, exclude: &[String]) {
    if exclude.is_empty() {
        return;
    }
    let cidrs = exclude.join(", ");
    let _ = writeln!(out, "define {}_exclude = [ {} ];", name, cidrs);
    let _ = writeln!(out, "filter {}_filter {{", name);
    let _ = writeln!(out, "if net !~ {}_exclude then accept;", name);
    out.push_str("reject;\n}\n");
}

fn filter_clause(name: &str, exclude: &[String]) -> String {
    if exclude.is_empty() {
        "all".to_string()
    } else {
        format!("filter {}_filter", name)
    }
}

/// Normalize indentation to two spaces per brace depth.
fn reindent(text: &str) -> String {
    let mut out = String::new();
    let mut depth: usize = 0;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            out.push('\n');
            continue;
        }
        let line_depth = if trimmed.starts_with('}') {
            depth.saturating_sub(1)
        } else {
            depth
        };
        for _ in 0..line_depth {
            out.push_str("  ");
        }
        out.push_str(trimmed);
        out.push('\n');
        let opens = trimmed.matches('{').count();
        let closes = trimmed.matches('}').count();
        depth = (depth + opens).saturating_sub(closes);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> RouterConfigSpec {
        let mut areas = BTreeMap::new();
        let mut zero = BTreeMap::new();
        zero.insert(
            "netA-7".to_string(),
            OspfInterfaceConfig {
                cost: Some(1000),
                iface_type: Some("ptp".to_string()),
                auth: None,
            },
        );
        areas.insert("0".to_string(), zero);

        let mut bfd = BTreeMap::new();
        bfd.insert(
            "netA-7".to_string(),
            BfdInterfaceConfig {
                interval_ms: Some(1000),
                idle_ms: Some(5000),
                multiplier: Some(5),
                ..BfdInterfaceConfig::default()
            },
        );

        RouterConfigSpec {
            router_id: Some("10.0.0.1".to_string()),
            direct_interface_names: vec!["netA-veth1".to_string()],
            ospf_import_exclude: vec!["10.0.0.0/30".to_string()],
            ospf_export_exclude: Vec::new(),
            ospf_area_config: areas,
            bfd_config: bfd,
            debug_protocols: None,
            disable_logging: false,
            git_version: Some("v1.2.3".to_string()),
            generated_at: Some("2026-01-01T00:00:00Z".to_string()),
        }
    }

    #[test]
    fn identical_inputs_render_identical_text() {
        let spec = sample_spec();
        assert_eq!(render(&spec), render(&spec));
    }

    #[test]
    fn peer_interface_block_carries_bfd_cost_and_type() {
        let text = render(&sample_spec());
        assert!(text.contains("area 0 {"));
        assert!(text.contains("interface \"netA-7\" {"));
        let iface_block = text.split("interface \"netA-7\" {").nth(1).unwrap();
        let iface_block = iface_block.split("};").next().unwrap();
        assert!(iface_block.contains("bfd yes;"));
        assert!(iface_block.contains("cost 1000;"));
        assert!(iface_block.contains("type ptp;"));
    }

    #[test]
    fn empty_exclude_list_means_direction_all() {
        let text = render(&sample_spec());
        assert!(text.contains("import filter ospf_import_filter;"));
        assert!(text.contains("export all;"));
        assert!(text.contains("define ospf_import_exclude = [ 10.0.0.0/30 ];"));
        assert!(text.contains("if net !~ ospf_import_exclude then accept;"));
        assert!(!text.contains("ospf_export_filter"));
    }

    #[test]
    fn bfd_only_marks_interfaces_with_entries() {
        let mut spec = sample_spec();
        spec.bfd_config.clear();
        let text = render(&spec);
        assert!(!text.contains("bfd yes;"));
        assert!(!text.contains("protocol bfd"));
    }

    #[test]
    fn auth_renders_hmac_password_block() {
        let mut spec = sample_spec();
        spec.ospf_area_config
            .get_mut("0")
            .unwrap()
            .get_mut("netA-7")
            .unwrap()
            .auth = Some("s3cret".to_string());
        let text = render(&spec);
        assert!(text.contains("authentication cryptographic;"));
        assert!(text.contains("password \"s3cret\" { algorithm hmac sha512; };"));
    }

    #[test]
    fn reindent_tracks_brace_depth() {
        let raw = "a {\nb {\nc;\n}\nd;\n}\n";
        assert_eq!(reindent(raw), "a {\n  b {\n    c;\n  }\n  d;\n}\n");
    }

    #[test]
    fn disable_logging_drops_the_log_line() {
        let mut spec = sample_spec();
        spec.disable_logging = true;
        assert!(!render(&spec).contains("log syslog"));
    }
}
