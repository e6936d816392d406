//! Helpers for turning `resolvectl`, `nmcli`, `ip route` and `resolv.conf`
//! output into resolver addresses the integrator can reason about.

use regex::Regex;
use std::sync::OnceLock;

fn is_ip_token(token: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:\d{1,3}(?:\.\d{1,3}){3}|[0-9A-Fa-f:]*:[0-9A-Fa-f:.]*)(?:%\S+)?(?:#\S+)?$").ok()
    })
    .as_ref()
    .is_some_and(|re| re.is_match(token))
}

fn push_unique(servers: &mut Vec<String>, candidate: &str) {
    let addr = candidate
        .split(['#', '%'])
        .next()
        .unwrap_or_default()
        .trim();
    if !addr.is_empty() && !servers.iter().any(|s| s == addr) {
        servers.push(addr.to_string());
    }
}

/// Servers from `resolvectl status`, current server first.
///
/// The global section is listed before links, and `DNS Servers:` may wrap onto
/// continuation lines that only carry addresses.
pub(crate) fn parse_resolvectl_status(output: &str) -> Vec<String> {
    let mut current = Vec::new();
    let mut listed = Vec::new();
    let mut in_list = false;

    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("Current DNS Server:") {
            in_list = false;
            for token in rest.split_whitespace() {
                push_unique(&mut current, token);
            }
        } else if let Some(rest) = trimmed.strip_prefix("DNS Servers:") {
            in_list = true;
            for token in rest.split_whitespace() {
                push_unique(&mut listed, token);
            }
        } else if in_list
            && !trimmed.is_empty()
            && trimmed.split_whitespace().all(is_ip_token)
        {
            for token in trimmed.split_whitespace() {
                push_unique(&mut listed, token);
            }
        } else {
            in_list = false;
        }
    }

    for server in listed {
        push_unique(&mut current, &server);
    }
    current
}

/// `IP4.DNS[n]:` entries from `nmcli dev show`, in device order.
pub(crate) fn parse_nmcli_dns(output: &str) -> Vec<String> {
    let mut servers = Vec::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with("IP4.DNS") {
            continue;
        }
        if let Some((_, value)) = trimmed.split_once(':') {
            push_unique(&mut servers, value.trim());
        }
    }
    servers
}

/// `nameserver` lines from a resolv.conf body; comments are skipped.
pub(crate) fn parse_resolv_conf(contents: &str) -> Vec<String> {
    let mut servers = Vec::new();
    for line in contents.lines() {
        let line = line.split(['#', ';']).next().unwrap_or_default();
        let mut fields = line.split_whitespace();
        if fields.next() == Some("nameserver") {
            if let Some(addr) = fields.next() {
                push_unique(&mut servers, addr);
            }
        }
    }
    servers
}

/// Interface of the default route from `ip route show default`.
pub(crate) fn parse_default_interface(output: &str) -> Option<String> {
    let fields: Vec<&str> = output.split_whitespace().collect();
    fields
        .windows(2)
        .find(|pair| pair[0] == "dev")
        .map(|pair| pair[1].to_string())
}

/// Body written when we take over resolv.conf directly.
pub(crate) fn render_resolv_conf(header: &str, servers: &[String]) -> String {
    let mut body = format!("# {header}\n");
    for server in servers {
        body.push_str("nameserver ");
        body.push_str(server);
        body.push('\n');
    }
    body
}
