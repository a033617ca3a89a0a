use std::{
    fs::File,
    io::{stdout, BufReader, Write},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use pancam::{Reassembler, ReassemblerConfig, Report};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{error, info};

use crate::Format;

#[derive(Debug, Clone, Serialize)]
struct LogSummary {
    filename: String,
    report: Option<Report>,
    error: Option<String>,
}

fn process_log(reassembler: &mut Reassembler, path: &Path) -> LogSummary {
    info!("reading {}", path.display());
    let zult = File::open(path)
        .with_context(|| format!("opening {path:?}"))
        .and_then(|file| {
            reassembler
                .process(BufReader::new(file))
                .with_context(|| format!("processing {path:?}"))
        });

    let filename = path.to_string_lossy().to_string();
    match zult {
        Ok(report) => LogSummary {
            filename,
            report: Some(report),
            error: None,
        },
        Err(err) => {
            error!("{err:#}");
            LogSummary {
                filename,
                report: None,
                error: Some(format!("{err:#}")),
            }
        }
    }
}

// Incomplete transfers are only flagged when the next transfer starts, so the
// last one of a run can only be reported.
fn note_pending(reassembler: &Reassembler) {
    for (unit_id, unit) in reassembler.pending() {
        info!(
            unit_id,
            expected = unit.expected_len,
            written = unit.bytes_written,
            "transfer incomplete at end of input"
        );
    }
}

pub fn extract(
    inputs: &[PathBuf],
    config: ReassemblerConfig,
    parallel: bool,
    format: &Format,
) -> Result<()> {
    let logs: Vec<LogSummary> = if parallel {
        inputs
            .par_iter()
            .map(|path| {
                let mut reassembler = Reassembler::new(config.clone());
                let summary = process_log(&mut reassembler, path);
                note_pending(&reassembler);
                summary
            })
            .collect()
    } else {
        let mut reassembler = Reassembler::new(config);
        let logs = inputs
            .iter()
            .map(|path| process_log(&mut reassembler, path))
            .collect();
        note_pending(&reassembler);
        logs
    };

    match format {
        Format::Json => {
            serde_json::to_writer_pretty(stdout(), &logs).context("serializing to json")?;
        }
        Format::Text => {
            let data = render_text(&logs).context("serializing summary")?;
            stdout()
                .write_all(data.as_bytes())
                .context("writing to stdout")?;
        }
    }

    let failed = logs.iter().filter(|l| l.error.is_some()).count();
    if failed > 0 {
        bail!("{failed} of {} logs failed", logs.len());
    }
    Ok(())
}

#[derive(Serialize)]
struct TextContext<'a> {
    logs: &'a [LogSummary],
}

fn render_text(logs: &[LogSummary]) -> Result<String> {
    let mut hb = handlebars::Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);
    hb.register_template_string("extract", TEXT_TEMPLATE)
        .context("registering template")?;

    hb.render("extract", &TextContext { logs })
        .context("rendering text")
}

const TEXT_TEMPLATE: &str = r"{{ #each logs }}{{ filename }}
===============================================================================
{{ #if error }}FAILED:        {{ error }}
{{ else }}Records:       {{ report.records }}
First:         {{ report.first_fragments }}
Continuation:  {{ report.continuation_fragments }}
Skipped:       {{ report.skipped_fragments }}
Created:       {{ #each report.created }}
    {{ this }}{{ /each }}
Partial:       {{ #each report.partial }}
    {{ this }}{{ /each }}
Warnings:      {{ len report.warnings }}{{ #each report.warnings }}
    {{ kind }} unit {{ unit_id }}{{ /each }}
{{ /if }}
{{ /each }}";
