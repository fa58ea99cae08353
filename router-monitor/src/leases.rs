use std::fmt::Display;
use std::path::Path;

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::error::DnsmasqError;

const MIN_LEASE_FIELDS: usize = 4;

/// One line of the dnsmasq lease file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LeaseRecord {
    /// Unix seconds; zero means an infinite lease.
    pub expiry: i64,
    pub mac: String,
    pub ip: String,
    /// `None` when dnsmasq wrote `*`.
    pub hostname: Option<String>,
}

impl LeaseRecord {
    /// Hostname as dnsmasq wrote it, `*` when unset.
    pub fn devicename(&self) -> &str {
        self.hostname.as_deref().unwrap_or("*")
    }
}

impl Display for LeaseRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\texpiry={}",
            self.ip,
            self.mac,
            self.devicename(),
            self.expiry
        )
    }
}

/// Parse a lease line: `expiry mac ip hostname [client-id]`.
pub fn parse_lease_line(line_no: usize, line: &str) -> Result<LeaseRecord, DnsmasqError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < MIN_LEASE_FIELDS {
        return Err(DnsmasqError::LeaseFields {
            line: line_no,
            got: fields.len(),
            want: MIN_LEASE_FIELDS,
        });
    }

    let expiry = fields[0]
        .parse::<i64>()
        .map_err(|_| DnsmasqError::LeaseExpiry {
            line: line_no,
            value: fields[0].to_string(),
        })?;
    let hostname = match fields[3] {
        "*" => None,
        name => Some(name.to_string()),
    };

    Ok(LeaseRecord {
        expiry,
        mac: fields[1].to_string(),
        ip: fields[2].to_string(),
        hostname,
    })
}

/// Read the whole lease file. Any line short of four fields, blank ones
/// included, fails the read.
pub async fn read_leases(path: &Path) -> Result<Vec<LeaseRecord>, DnsmasqError> {
    let file_err = |source| DnsmasqError::LeaseFile {
        path: path.display().to_string(),
        source,
    };
    let file = tokio::fs::File::open(path).await.map_err(file_err)?;
    let mut lines = BufReader::new(file).lines();

    let mut records = Vec::new();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await.map_err(file_err)? {
        line_no += 1;
        records.push(parse_lease_line(line_no, &line)?);
    }
    Ok(records)
}
