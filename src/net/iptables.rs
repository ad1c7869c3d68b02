use std::collections::HashMap;

use crate::net::error::{NetError, NetResult};
use crate::utils::command::{CommandError, CommandExecutor, CommandOutput};

/// iptables operations scoped to one execution context (root or a netns).
///
/// All mutations go through the binary rather than netlink so the rules the
/// agent authors look exactly like the rules it later finds in
/// `iptables-save` output.
pub struct Iptables {
    netns: String,
}

impl Iptables {
    /// Operate on the root namespace tables.
    pub fn root() -> Self {
        Self {
            netns: String::new(),
        }
    }

    /// Operate inside a named network namespace.
    pub fn in_ns(ns: &str) -> Self {
        Self {
            netns: ns.to_string(),
        }
    }

    pub async fn chain_exists(&self, table: &str, chain: &str) -> NetResult<bool> {
        let argv = self.base_argv(table, &["-nL", chain]);
        let out = CommandExecutor::run_privileged_raw(&self.netns, argv).await?;
        if out.success {
            return Ok(true);
        }
        if is_missing_object_error(&out.stderr) {
            return Ok(false);
        }
        Err(command_failure("iptables -nL", &out))
    }

    /// Create a chain, treating "already exists" as success.
    pub async fn create_chain(&self, table: &str, chain: &str) -> NetResult<()> {
        let argv = self.base_argv(table, &["-N", chain]);
        let out = CommandExecutor::run_privileged_raw(&self.netns, argv).await?;
        if out.success || out.stderr.contains("Chain already exists") {
            Ok(())
        } else {
            Err(command_failure("iptables -N", &out))
        }
    }

    /// Check a rule with `-C`. The kernel reports a missing rule through two
    /// different error strings depending on what is absent; both mean `false`
    /// here, anything else is a real failure.
    pub async fn rule_exists(&self, table: &str, chain: &str, rule: &[String]) -> NetResult<bool> {
        let mut args = vec!["-C".to_string(), chain.to_string()];
        args.extend(rule.iter().cloned());
        let argv = self.table_argv(table, args);
        let out = CommandExecutor::run_privileged_raw(&self.netns, argv).await?;
        if out.success {
            return Ok(true);
        }
        if is_missing_object_error(&out.stderr) {
            return Ok(false);
        }
        Err(command_failure("iptables -C", &out))
    }

    pub async fn append_if_missing(
        &self,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> NetResult<()> {
        if self.rule_exists(table, chain, rule).await? {
            return Ok(());
        }
        let mut args = vec!["-A".to_string(), chain.to_string()];
        args.extend(rule.iter().cloned());
        CommandExecutor::run_privileged(&self.netns, self.table_argv(table, args)).await?;
        tracing::debug!(table, chain, "appended rule: {}", rule.join(" "));
        Ok(())
    }

    /// Insert at position 1 unless the rule is already present anywhere in
    /// the chain.
    pub async fn insert_if_missing(
        &self,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> NetResult<()> {
        if self.rule_exists(table, chain, rule).await? {
            return Ok(());
        }
        let mut args = vec!["-I".to_string(), chain.to_string(), "1".to_string()];
        args.extend(rule.iter().cloned());
        CommandExecutor::run_privileged(&self.netns, self.table_argv(table, args)).await?;
        tracing::debug!(table, chain, "inserted rule: {}", rule.join(" "));
        Ok(())
    }

    pub async fn delete_if_present(
        &self,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> NetResult<()> {
        if !self.rule_exists(table, chain, rule).await? {
            return Ok(());
        }
        let mut args = vec!["-D".to_string(), chain.to_string()];
        args.extend(rule.iter().cloned());
        CommandExecutor::run_privileged(&self.netns, self.table_argv(table, args)).await?;
        tracing::debug!(table, chain, "deleted rule: {}", rule.join(" "));
        Ok(())
    }

    /// Flush a chain, best-effort.
    pub async fn flush(&self, table: &str, chain: &str) {
        let argv = self.base_argv(table, &["-F", chain]);
        match CommandExecutor::run_privileged_raw(&self.netns, argv).await {
            Ok(out) if out.success => {}
            Ok(out) => tracing::debug!(table, chain, "flush skipped: {}", out.stderr.trim()),
            Err(e) => tracing::warn!(table, chain, "flush failed: {}", e),
        }
    }

    /// Parse `iptables-save` into `table -> [-A ... rule lines]`.
    pub async fn dump_all(&self) -> NetResult<HashMap<String, Vec<String>>> {
        let argv = vec!["iptables-save".to_string()];
        let output = CommandExecutor::run_privileged(&self.netns, argv).await?;
        Ok(parse_save_output(&output))
    }

    /// Delete every rule in `table`/`chain` whose dump line carries `tag`.
    /// The deletion replays the full rule spec captured from the live dump.
    pub async fn purge_tagged(&self, table: &str, chain: &str, tag: &str) -> NetResult<()> {
        let dump = self.dump_all().await?;
        let Some(lines) = dump.get(table) else {
            return Ok(());
        };
        let prefix = format!("-A {} ", chain);
        for line in lines {
            if !line.starts_with(&prefix) || !line.contains(tag) {
                continue;
            }
            let spec = split_rule_tokens(&line[prefix.len()..]);
            let mut args = vec!["-D".to_string(), chain.to_string()];
            args.extend(spec);
            CommandExecutor::run_privileged(&self.netns, self.table_argv(table, args)).await?;
            tracing::debug!(table, chain, tag, "purged tagged rule");
        }
        Ok(())
    }

    fn base_argv(&self, table: &str, args: &[&str]) -> Vec<String> {
        let mut argv = vec!["iptables".to_string(), "-t".to_string(), table.to_string()];
        argv.extend(args.iter().map(|s| s.to_string()));
        argv
    }

    fn table_argv(&self, table: &str, args: Vec<String>) -> Vec<String> {
        let mut argv = vec!["iptables".to_string(), "-t".to_string(), table.to_string()];
        argv.extend(args);
        argv
    }
}

/// The one place that knows the kernel's "that thing does not exist" error
/// strings. Adapt here if a future iptables changes its wording.
fn is_missing_object_error(stderr: &str) -> bool {
    stderr.contains("Bad rule") || stderr.contains("No chain/target/match")
}

fn command_failure(what: &str, out: &CommandOutput) -> NetError {
    NetError::Command(CommandError::Failed {
        cmd: what.to_string(),
        exit_code: out.exit_code,
        stderr: out.stderr.clone(),
    })
}

/// Extract `-A` rule lines per table from `iptables-save` output. Table
/// headers (`*nat`), chain declarations (`:POSTROUTING ACCEPT [0:0]`),
/// comments and `COMMIT` terminators are consumed, not kept.
fn parse_save_output(output: &str) -> HashMap<String, Vec<String>> {
    let mut tables: HashMap<String, Vec<String>> = HashMap::new();
    let mut current: Option<String> = None;
    for line in output.lines() {
        let line = line.trim_end();
        if let Some(name) = line.strip_prefix('*') {
            current = Some(name.to_string());
            tables.entry(name.to_string()).or_default();
        } else if line.starts_with("-A ") {
            if let Some(table) = &current {
                if let Some(rules) = tables.get_mut(table) {
                    rules.push(line.to_string());
                }
            }
        }
        // ':' chain defaults, '#' comments and COMMIT are ignored.
    }
    tables
}

/// Split a dump rule spec into argv tokens, honoring the double quotes
/// `iptables-save` wraps around comment values.
fn split_rule_tokens(spec: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    for ch in spec.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !cur.is_empty() {
                    tokens.push(std::mem::take(&mut cur));
                }
            }
            c => cur.push(c),
        }
    }
    if !cur.is_empty() {
        tokens.push(cur);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAVE_FIXTURE: &str = "\
# Generated by iptables-save v1.8.7\n\
*nat\n\
:PREROUTING ACCEPT [0:0]\n\
:POSTROUTING ACCEPT [0:0]\n\
:netA-POSTROUTING - [0:0]\n\
-A POSTROUTING -j netA-POSTROUTING\n\
-A netA-POSTROUTING -o eth0 -j MASQUERADE\n\
COMMIT\n\
*filter\n\
:INPUT ACCEPT [10:840]\n\
:netA-INPUT - [0:0]\n\
-A INPUT -j netA-INPUT\n\
-A netA-INPUT -p udp -m udp --dport 51820 -m comment --comment \"#peer_netA-7#\" -j ACCEPT\n\
COMMIT\n";

    #[test]
    fn save_parser_keeps_only_append_lines() {
        let tables = parse_save_output(SAVE_FIXTURE);
        assert_eq!(tables.len(), 2);
        assert_eq!(tables["nat"].len(), 2);
        assert_eq!(tables["filter"].len(), 2);
        assert!(tables["nat"][1].ends_with("-j MASQUERADE"));
        assert!(!tables["filter"].iter().any(|l| l.starts_with(':')));
    }

    #[test]
    fn rule_tokenizer_unwraps_quoted_comments() {
        let spec = "-p udp -m udp --dport 51820 -m comment --comment \"#peer_netA-7#\" -j ACCEPT";
        let tokens = split_rule_tokens(spec);
        assert_eq!(tokens[7], "#peer_netA-7#");
        assert_eq!(tokens.len(), 10);
        assert_eq!(tokens.last().map(String::as_str), Some("ACCEPT"));
    }

    #[test]
    fn missing_object_predicate_matches_both_kernel_strings() {
        assert!(is_missing_object_error("iptables: Bad rule (does a matching rule exist?)."));
        assert!(is_missing_object_error(
            "iptables: No chain/target/match by that name."
        ));
        assert!(!is_missing_object_error("iptables: Permission denied."));
    }
}
