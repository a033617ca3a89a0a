use std::{
    io::{stdout, Write},
    path::PathBuf,
};

use anyhow::{bail, Context, Result};
use pancam::{read_header, CameraHeader, ImageHeader};
use serde::Serialize;
use tracing::error;

use crate::Format;

#[derive(Debug, Serialize)]
struct HeaderInfo {
    filename: String,
    image_id: String,
    browse_label: String,
    camera: &'static str,
    header: ImageHeader,
}

pub fn header(inputs: &[PathBuf], model: &str, format: &Format) -> Result<()> {
    let mut infos = Vec::default();
    let mut failed = 0;
    for path in inputs {
        match read_header(path).with_context(|| format!("decoding header of {path:?}")) {
            Ok(header) => infos.push(HeaderInfo {
                filename: path.to_string_lossy().to_string(),
                image_id: header.image_id(),
                browse_label: header.browse_label(model),
                camera: match header.camera_header {
                    CameraHeader::Wac(_) => "WAC",
                    CameraHeader::Hrc(_) => "HRC",
                },
                header,
            }),
            Err(err) => {
                error!("{err:#}");
                failed += 1;
            }
        }
    }

    match format {
        Format::Json => {
            serde_json::to_writer_pretty(stdout(), &infos).context("serializing to json")?;
        }
        Format::Text => {
            let mut hb = handlebars::Handlebars::new();
            hb.register_escape_fn(handlebars::no_escape);
            hb.register_template_string("header", TEXT_TEMPLATE)
                .context("registering template")?;
            let data = hb
                .render("header", &serde_json::json!({ "infos": infos }))
                .context("rendering text")?;
            stdout()
                .write_all(data.as_bytes())
                .context("writing to stdout")?;
        }
    }

    if failed > 0 {
        bail!("{failed} of {} headers failed to decode", inputs.len());
    }
    Ok(())
}

const TEXT_TEMPLATE: &str = r"{{ #each infos }}{{ filename }}
===============================================================================
Image ID:      {{ image_id }}
Browse:        {{ browse_label }}
Camera:        {{ camera }} ({{ header.camera }})
Filter:        {{ header.filter }}
Sol:           {{ header.sol }}
Task:          {{ header.task_id }} run {{ header.task_run }}
Data length:   {{ header.data_len }}
Packet CUC:    {{ header.packet_cuc }}
PIU time:      {{ header.instrument_time }}
{{ #each header.camera_header }}{{ @key }}: {{ this }}
{{ /each }}{{ /each }}";
