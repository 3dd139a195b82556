// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! v4l2probe, prints what a stateless decoder node pair can do.

use std::path::PathBuf;

use anyhow::anyhow;
use anyhow::Context;
use argh::FromArgs;
use serde_json::json;
use v4l2_stateless::DecodedFormat;
use v4l2_stateless::DecoderConfig;
use v4l2_stateless::Fourcc;
use v4l2_stateless::V4l2Decoder;

/// Probe a V4L2 stateless decoder.
#[derive(FromArgs, Debug)]
struct Args {
    /// media controller node
    #[argh(option, default = "PathBuf::from(\"/dev/media0\")")]
    media: PathBuf,

    /// video node
    #[argh(option, default = "PathBuf::from(\"/dev/video0\")")]
    video: PathBuf,

    /// coded format to negotiate, e.g. S264. Defaults to the first one the driver reports.
    #[argh(option, from_str_fn(parse_fourcc))]
    input_format: Option<Fourcc>,

    /// coded width
    #[argh(option, default = "1920")]
    width: u32,

    /// coded height
    #[argh(option, default = "1080")]
    height: u32,

    /// decoded formats to try, in order of preference
    #[argh(option)]
    output_format: Vec<DecodedFormat>,
}

fn parse_fourcc(value: &str) -> Result<Fourcc, String> {
    let bytes = <[u8; 4]>::try_from(value.as_bytes())
        .map_err(|_| format!("{value:?} is not a four character code"))?;
    Ok(Fourcc::from(&bytes))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();

    let decoder = V4l2Decoder::from_config(DecoderConfig::new(&args.media, &args.video));
    decoder.open().context("opening decoder nodes")?;

    let input_formats = decoder.input_formats()?;
    let input_format = match args.input_format {
        Some(fourcc) => fourcc,
        None => *input_formats.first().ok_or_else(|| anyhow!("driver reports no coded formats"))?,
    };
    decoder.set_input_format(input_format, args.width, args.height)?;

    let caps = decoder.enumerate_output_formats()?;
    let candidates =
        if args.output_format.is_empty() { caps.formats().to_vec() } else { args.output_format };
    let selected = decoder.select_output_format(&candidates)?;

    // Requests are the only way to submit work, so make sure the media node hands them out.
    let request = decoder.alloc_request().context("allocating a media request")?;
    request.free();

    let report = json!({
        "media": args.media,
        "video": args.video,
        "input_formats": input_formats.iter().map(|f| f.to_string()).collect::<Vec<_>>(),
        "input_format": input_format.to_string(),
        "output_formats": caps.formats().iter().map(|f| f.to_string()).collect::<Vec<_>>(),
        "selected": {
            "format": selected.format.to_string(),
            "width": selected.width,
            "height": selected.height,
            "size": selected.size,
            "planes": selected
                .planes
                .iter()
                .map(|p| json!({ "stride": p.stride, "offset": p.offset }))
                .collect::<Vec<_>>(),
        },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    decoder.close();
    Ok(())
}
