// Copyright 2017 CoreOS, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! DHCP lease file lookup
//!
//! Lease files use the dnsmasq layout, one lease per line:
//! `<expiry> <mac> <ip> <hostname> <client-id>`.

use anyhow::{bail, Context, Result};
use pnet_base::MacAddr;
use slog_scope::{debug, trace};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::str::FromStr;

/// Parse a single lease line into its MAC and IP fields.
fn lease_line(line: &str) -> Option<(MacAddr, &str)> {
    let mut fields = line.split_whitespace();
    let _expiry: u64 = fields.next()?.parse().ok()?;
    let mac = MacAddr::from_str(fields.next()?).ok()?;
    let ip = fields.next()?;
    Some((mac, ip))
}

/// Find the MAC address leased to `ip`.
///
/// Malformed lines are skipped.
pub fn leased_mac<R: Read>(reader: R, ip: &str) -> Result<MacAddr> {
    let contents = BufReader::new(reader);

    for l in contents.lines() {
        let l = l.context("failed to read lease")?;
        match lease_line(&l) {
            Some((mac, lease_ip)) if lease_ip == ip => return Ok(mac),
            Some(_) => {}
            None => trace!("skipping malformed lease line: {:?}", l),
        }
    }
    bail!("no lease found for IP {}", ip)
}

/// Find the MAC address leased to `ip` in the lease file at `path`.
pub fn lease_file_mac(path: &Path, ip: &str) -> Result<MacAddr> {
    debug!("looking up lease for {} in {:?}", ip, path);
    let lease =
        File::open(path).with_context(|| format!("failed to open lease file ({path:?})"))?;
    leased_mac(lease, ip).with_context(|| format!("in lease file {path:?}"))
}
