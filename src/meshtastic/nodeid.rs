//! Node id encoding: 32-bit node numbers are shown as 8 lowercase hex digits.

/// `0xbeef` -> `"0000beef"`.
pub fn node_id_to_hex(id: u32) -> String {
    format!("{:08x}", id)
}

/// Parse an 8-digit hex node id (optionally prefixed with `!`).
pub fn node_hex_to_id(hex: &str) -> Option<u32> {
    let hex = hex.trim().trim_start_matches('!');
    if hex.is_empty() {
        return None;
    }
    u32::from_str_radix(hex, 16).ok()
}

/// True for exactly 8 hex digits.
pub fn is_node_hex(candidate: &str) -> bool {
    candidate.len() == 8 && candidate.chars().all(|c| c.is_ascii_hexdigit())
}

/// Normalise a user supplied node reference.
///
/// An 8 hex digit id is passed through (lowercased); anything else is read as
/// a decimal node number and converted. Empty or unparseable input gives
/// `None`.
pub fn validate_node_id(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if is_node_hex(trimmed) {
        return Some(trimmed.to_ascii_lowercase());
    }
    trimmed.parse::<u32>().ok().map(node_id_to_hex)
}

/// Strip a MeshView `packet_list` link prefix and a leading `!` from a node
/// reference before validating it.
pub fn parse_node_ref(input: &str, mesh_view_base_url: &str) -> Option<String> {
    let mut candidate = input.trim();
    if !mesh_view_base_url.is_empty() {
        let prefix = format!("{}/packet_list/", mesh_view_base_url.trim_end_matches('/'));
        if let Some(rest) = candidate.strip_prefix(prefix.as_str()) {
            candidate = rest;
        }
    }
    validate_node_id(candidate.trim_start_matches('!'))
}
