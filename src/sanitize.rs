// src/sanitize.rs
//
// Output sanitization to prevent information leaks before a finding crosses
// the controller's API boundary.

use crate::model::{AddressInfo, Output};
use html_escape::encode_text;

/// Sanitizes an [`Output`] record before it is handed to the caller.
///
/// Strips control characters and HTML-escapes every free-text field (name,
/// domain, source, and each netblock/ASN description), and redacts
/// filesystem-looking paths out of any of them. Numeric and structured
/// fields (timestamp, addresses, asn numbers) pass through unchanged.
pub fn sanitize_output(output: &Output) -> Output {
    Output {
        timestamp: output.timestamp,
        name: sanitize_domain(&output.name),
        domain: sanitize_domain(&output.domain),
        addresses: output.addresses.iter().map(sanitize_address_info).collect(),
        tag: output.tag,
        source: sanitize_string(&output.source),
    }
}

fn sanitize_address_info(info: &AddressInfo) -> AddressInfo {
    AddressInfo {
        address: info.address,
        netblock: info.netblock,
        asn: info.asn,
        description: sanitize_string(&info.description),
    }
}

fn sanitize_domain(domain: &str) -> String {
    sanitize_string(domain)
}

fn sanitize_string(value: &str) -> String {
    let trimmed = value.trim();
    let filtered = trimmed.chars().filter(|c| !c.is_control()).collect::<String>();
    let escaped = encode_text(&filtered).to_string();
    redact_paths(&escaped)
}

fn redact_paths(value: &str) -> String {
    let path_pattern = regex::Regex::new(r"(/[a-zA-Z0-9_\-\.]+)+")
        .unwrap_or_else(|_| regex::Regex::new(r"").unwrap());
    path_pattern.replace_all(value, "[REDACTED_PATH]").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tag;
    use std::net::{IpAddr, Ipv4Addr};

    fn sample_output() -> Output {
        Output {
            timestamp: 1234,
            name: "<script>evil.example.com".to_string(),
            domain: "example.com\n\rinjection".to_string(),
            addresses: vec![AddressInfo {
                address: IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
                netblock: "1.2.3.0/24".parse().unwrap(),
                asn: 64500,
                description: "Failed at /home/user/code.rs".to_string(),
            }],
            tag: Tag::Dns,
            source: "worker<img src=x>".to_string(),
        }
    }

    #[test]
    fn escapes_html_in_name_and_domain() {
        let sanitized = sanitize_output(&sample_output());
        assert_eq!(sanitized.name, "&lt;script&gt;evil.example.com");
        assert_eq!(sanitized.domain, "example.cominjection");
    }

    #[test]
    fn redacts_paths_in_descriptions() {
        let sanitized = sanitize_output(&sample_output());
        assert_eq!(sanitized.addresses[0].description, "Failed at [REDACTED_PATH]");
    }

    #[test]
    fn escapes_html_in_source() {
        let sanitized = sanitize_output(&sample_output());
        assert_eq!(sanitized.source, "worker&lt;img src=x&gt;");
    }

    #[test]
    fn numeric_fields_pass_through() {
        let sanitized = sanitize_output(&sample_output());
        assert_eq!(sanitized.timestamp, 1234);
        assert_eq!(sanitized.addresses[0].asn, 64500);
    }
}
