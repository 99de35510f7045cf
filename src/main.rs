use anyhow::{bail, Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use jkbms_lib::protocol::{decode_frame, encode_command, DecodedFrame};
use jkbms_lib::reassembly::{Feed, FrameAssembler};
use log::*;
use std::{ops::Deref, panic};

mod commandline;
mod monitor;

use commandline::{CliArgs, CliCommands, OutputFormat};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let digits: Vec<char> = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    let digits: &[char] = match digits.as_slice() {
        ['0', 'x' | 'X', rest @ ..] => rest,
        all => all,
    };
    if digits.len() % 2 != 0 {
        bail!("Odd number of hex digits in '{input}'");
    }
    digits
        .chunks(2)
        .map(|pair| {
            let byte: String = pair.iter().collect();
            u8::from_str_radix(&byte, 16).with_context(|| format!("Invalid hex byte '{byte}'"))
        })
        .collect()
}

fn print_frame(frame: &DecodedFrame, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => println!("{frame:#?}"),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(frame).with_context(|| "Cannot serialize frame")?
        ),
    }
    Ok(())
}

fn decode(chunks: &[String], format: OutputFormat) -> Result<()> {
    let mut assembler = FrameAssembler::new();
    let mut decoded = 0;
    for chunk in chunks {
        let bytes = parse_hex(chunk)?;
        match assembler.feed(&bytes) {
            Feed::Complete(frame) => {
                let frame = decode_frame(frame.as_bytes()).with_context(|| "Cannot decode frame")?;
                print_frame(&frame, format)?;
                decoded += 1;
            }
            Feed::OutOfSync => warn!("Skipping chunk without frame start: {chunk}"),
            Feed::TooShort => warn!("Skipping short chunk: {chunk}"),
            Feed::Started { .. } | Feed::Appended => {}
        }
    }
    if decoded == 0 {
        bail!("No complete frame, state {:?}", assembler.state());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    match args.command {
        CliCommands::Monitor { interval, format } => {
            let config = monitor::load_config(&args.config_file, &args.device)?;
            monitor::run(config, interval, format).await?;
        }
        CliCommands::Decode { chunks, format } => decode(&chunks, format)?,
        CliCommands::Encode {
            register,
            value,
            length,
        } => {
            let command = encode_command(register, value, length);
            println!("{command:02X?}");
        }
    }

    Ok(())
}
