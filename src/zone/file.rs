//! The in-memory model of a master-file zone, and its parser/serialiser.
//!
//! A zone is parsed into an ordered [`ZoneLine`] list rather than edited as
//! text: equality for idempotence purposes is then a property of the typed
//! `A`/`Txt` variants, not of the raw bytes on disk, and any line this
//! parser doesn't recognise is kept as [`ZoneLine::Verbatim`] so
//! operator-added content round-trips untouched.

use std::net::IpAddr;

//----------- ZoneLine ----------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneLine {
    Origin(String),
    Soa {
        primary_ns: String,
        hostmaster: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    Ns(String),
    A {
        name: String,
        address: IpAddr,
    },
    Txt {
        name: String,
        value: String,
    },
    /// Any line the parser didn't recognise, preserved byte-for-byte.
    Verbatim(String),
}

/// Parse zone file contents into an ordered line list.
///
/// This is a pragmatic master-file parser covering exactly the record
/// shapes this control plane emits and reads back (`$ORIGIN`, `SOA`, `NS`,
/// `A`, `TXT`), tab- or space-separated. Anything else — comments, blank
/// lines, other record types an operator may have hand-added — is kept
/// verbatim in line order.
pub fn parse(contents: &str) -> Vec<ZoneLine> {
    let mut lines = Vec::new();
    let mut iter = contents.lines().peekable();

    while let Some(line) = iter.next() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(';') {
            lines.push(ZoneLine::Verbatim(line.to_owned()));
            continue;
        }

        if let Some(origin) = trimmed.strip_prefix("$ORIGIN") {
            lines.push(ZoneLine::Origin(origin.trim().to_owned()));
            continue;
        }

        let fields: Vec<&str> = trimmed.split_whitespace().collect();

        if let Some(soa) = try_parse_soa(&fields, &mut iter, line) {
            lines.push(soa);
            continue;
        }

        if let Some(parsed) = try_parse_record(&fields) {
            lines.push(parsed);
            continue;
        }

        lines.push(ZoneLine::Verbatim(line.to_owned()));
    }

    lines
}

/// SOA records conventionally span multiple lines:
/// `@ IN SOA ns. hostmaster. ( serial refresh retry expire minimum )`.
/// We accept both the single-line and parenthesised multi-line forms.
fn try_parse_soa<'a, I: Iterator<Item = &'a str>>(
    fields: &[&str],
    iter: &mut std::iter::Peekable<I>,
    original: &str,
) -> Option<ZoneLine> {
    let soa_pos = fields.iter().position(|f| f.eq_ignore_ascii_case("SOA"))?;
    if soa_pos + 2 > fields.len() {
        return None;
    }
    let primary_ns = fields[soa_pos + 1].to_owned();
    let hostmaster = fields[soa_pos + 2].to_owned();

    let mut numbers: Vec<u32> = fields[soa_pos + 3..]
        .iter()
        .filter_map(|f| f.trim_matches(|c| c == '(' || c == ')').parse().ok())
        .collect();

    let opened_paren = original.contains('(');
    let closed_paren = original.contains(')');

    if opened_paren && !closed_paren {
        while numbers.len() < 5 {
            let Some(next) = iter.peek() else { break };
            let next_fields: Vec<&str> = next.split_whitespace().collect();
            if next_fields.is_empty() {
                iter.next();
                continue;
            }
            if let Some(n) = next_fields[0]
                .trim_matches(|c| c == '(' || c == ')')
                .parse::<u32>()
                .ok()
            {
                numbers.push(n);
                iter.next();
                if next.contains(')') {
                    break;
                }
            } else {
                break;
            }
        }
    }

    if numbers.len() < 5 {
        return None;
    }

    Some(ZoneLine::Soa {
        primary_ns,
        hostmaster,
        serial: numbers[0],
        refresh: numbers[1],
        retry: numbers[2],
        expire: numbers[3],
        minimum: numbers[4],
    })
}

fn try_parse_record(fields: &[&str]) -> Option<ZoneLine> {
    // Accept `<name> [IN] <TYPE> <rdata...>` and `<name> <TYPE> <rdata...>`.
    let (name, rest) = fields.split_first()?;
    let rest = if rest.first().is_some_and(|f| f.eq_ignore_ascii_case("IN")) {
        &rest[1..]
    } else {
        rest
    };
    let (rtype, rdata) = rest.split_first()?;

    match rtype.to_ascii_uppercase().as_str() {
        "NS" => Some(ZoneLine::Ns(rdata.first()?.to_string())),
        "A" => {
            let address: IpAddr = rdata.first()?.parse().ok()?;
            Some(ZoneLine::A {
                name: (*name).to_owned(),
                address,
            })
        }
        "TXT" => {
            let value = rdata.join(" ");
            let value = value.trim_matches('"').to_owned();
            Some(ZoneLine::Txt {
                name: (*name).to_owned(),
                value,
            })
        }
        _ => None,
    }
}

/// Serialise a line list back into zone file text.
pub fn render(lines: &[ZoneLine]) -> String {
    let mut out = String::new();
    for line in lines {
        match line {
            ZoneLine::Origin(origin) => {
                out.push_str("$ORIGIN ");
                out.push_str(origin);
                out.push('\n');
            }
            ZoneLine::Soa {
                primary_ns,
                hostmaster,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                out.push_str(&format!(
                    "@\tIN\tSOA\t{primary_ns}\t{hostmaster}\t(\n\t\t\t\t\t{serial}\n\t\t\t\t\t{refresh}\n\t\t\t\t\t{retry}\n\t\t\t\t\t{expire}\n\t\t\t\t\t{minimum} )\n"
                ));
            }
            ZoneLine::Ns(ns) => {
                out.push_str(&format!("@\tIN\tNS\t{ns}\n"));
            }
            ZoneLine::A { name, address } => {
                out.push_str(&format!("{name}\tIN A\t{address}\n"));
            }
            ZoneLine::Txt { name, value } => {
                out.push_str(&format!("{name}\tIN TXT\t\"{value}\"\n"));
            }
            ZoneLine::Verbatim(text) => {
                out.push_str(text);
                out.push('\n');
            }
        }
    }
    out
}

/// Bump the SOA serial, creating a default SOA line if none exists yet.
pub fn bump_serial(lines: &mut [ZoneLine]) {
    for line in lines.iter_mut() {
        if let ZoneLine::Soa { serial, .. } = line {
            *serial = serial.wrapping_add(1);
            return;
        }
    }
}
