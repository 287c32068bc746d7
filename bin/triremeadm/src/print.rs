// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Print command results in a human-friendly manner.

use crate::TokenSummary;
use crate::replay::Outcome;
use crate::replay::ReplayReport;
use std::io::Write;
use tabwriter::TabWriter;

fn outcome(o: &Option<Outcome>) -> String {
    match o {
        Some(o) => format!("{:?}: {}", o.verdict, o.detail),
        None => "-".to_string(),
    }
}

fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "")
}

/// Print a [`ReplayReport`].
pub fn print_replay(report: &ReplayReport) -> std::io::Result<()> {
    print_replay_into(&mut std::io::stdout(), report)
}

/// Print a [`ReplayReport`] into a given writer.
pub fn print_replay_into(
    writer: &mut impl Write,
    report: &ReplayReport,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "Packets")?;
    write_hr(&mut t)?;
    writeln!(t, "#\tFROM\tFLOW\tSENT\tRECEIVED")?;
    for s in &report.steps {
        writeln!(
            t,
            "{}\t{}\t{}\t{}\t{}",
            s.index,
            s.from.unwrap_or("unowned"),
            s.flow.map(|f| f.to_string()).unwrap_or_else(|| "-".into()),
            outcome(&s.sent),
            outcome(&s.received),
        )?;
    }
    t.flush()?;

    writeln!(t, "\nFlows")?;
    write_hr(&mut t)?;
    writeln!(t, "SIDE\tACTION\tFLOW\tSOURCE\tDEST\tPOLICY\tREASON\tCOUNT")?;
    for (side, r) in &report.flows {
        writeln!(
            t,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            side,
            r.action,
            r.flow,
            r.source_id,
            r.destination_id,
            r.policy.as_ref().map(|p| p.policy_id.as_str()).unwrap_or("-"),
            r.reason.map(|r| r.to_string()).unwrap_or_else(|| "-".into()),
            r.count,
        )?;
    }
    t.flush()?;

    if !report.packets.is_empty() {
        writeln!(t, "\nTraces")?;
        write_hr(&mut t)?;
        writeln!(t, "SIDE\tDIR\tFLOW\tFLAGS\tLEN\tSTAGE\tDROPPED\tERROR")?;
        for (side, p) in &report.packets {
            writeln!(
                t,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                side,
                p.dir,
                p.flow,
                p.tcp_flags,
                p.length,
                p.stage,
                p.dropped,
                p.error.as_deref().unwrap_or("-"),
            )?;
        }
        t.flush()?;
    }

    for (side, stats) in &report.stats {
        writeln!(t, "\nStats ({side})")?;
        write_hr(&mut t)?;
        for (name, val) in stats.iter().filter(|(_, v)| *v != 0) {
            writeln!(t, "{name}\t{val}")?;
        }
        t.flush()?;
    }

    writeln!(t)?;
    t.flush()
}

/// Print a [`TokenSummary`].
pub fn print_token(summary: &TokenSummary) -> std::io::Result<()> {
    print_token_into(&mut std::io::stdout(), summary)
}

/// Print a [`TokenSummary`] into a given writer.
pub fn print_token_into(
    writer: &mut impl Write,
    summary: &TokenSummary,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    match summary {
        TokenSummary::Claims { len, claims } => {
            let h = &claims.header;
            writeln!(t, "KIND\t{}", claims.kind)?;
            writeln!(t, "LENGTH\t{len}")?;
            writeln!(t, "VERSION\t{}", h.version)?;
            writeln!(t, "COMPRESSION\t{:?}", h.compression)?;
            writeln!(t, "ENCRYPT\t{}", h.encrypt)?;
            writeln!(t, "SOURCE\t{}", claims.id)?;
            writeln!(t, "EXPIRES\t{}", claims.expires)?;
            writeln!(t, "NONCE\t{}", hex::encode(claims.lcl))?;
            if let Some(rmt) = claims.rmt {
                writeln!(t, "ECHOED NONCE\t{}", hex::encode(rmt))?;
            }
            for tag in claims.tags.tags() {
                writeln!(t, "TAG\t{tag}")?;
            }
            for tag in claims.compressed_tags.tags() {
                writeln!(t, "COMPRESSED TAG\t{tag}")?;
            }
            writeln!(t, "SIGNATURE\tok")?;
        }

        TokenSummary::Ack { header, sender, receiver } => {
            writeln!(t, "KIND\tACK")?;
            writeln!(t, "VERSION\t{}", header.version)?;
            writeln!(t, "SENDER NONCE\t{}", hex::encode(sender))?;
            writeln!(t, "RECEIVER NONCE\t{}", hex::encode(receiver))?;
            writeln!(t, "SIGNATURE\tunverified")?;
        }
    }

    t.flush()
}
