//! Human-readable output for the CLI

use crate::backend::{ContainerConfig, ContainerStatus, Image};
use std::fmt::Write as _;
use std::io::{self, BufRead, Write};

const UNITS: [&str; 8] = ["KiB", "MiB", "GiB", "TiB", "PiB", "EiB", "ZiB", "YiB"];

/// Format a byte count with binary units, e.g. `1.5 KiB` or `213 MiB`
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        return if bytes == 1 {
            "1 byte".to_string()
        } else {
            format!("{} bytes", bytes)
        };
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rounded = format!("{:.2}", value);
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", trimmed, UNITS[unit])
}

/// Find an image by alias, falling back to fingerprint
pub fn find_image<'a>(images: &'a [Image], id: &str) -> Option<&'a Image> {
    images
        .iter()
        .find(|i| i.matches_alias(id))
        .or_else(|| images.iter().find(|i| i.fingerprint == id))
}

pub fn render_images(images: &[Image]) -> String {
    let mut out = String::from("Available images: \n");
    for image in images {
        let _ = writeln!(out, " - Fingerprint: {}", image.fingerprint);
        if !image.aliases.is_empty() {
            let aliases: Vec<&str> = image.aliases.iter().map(|a| a.name.as_str()).collect();
            let _ = writeln!(out, "   Aliases: {}", aliases.join(", "));
        }
        if let Some(description) = image.description() {
            let _ = writeln!(out, "   Description: {}", description);
        }
        let _ = writeln!(out, "   Size: {}", format_size(image.size));
    }
    out
}

pub fn render_status(status: &ContainerStatus) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Container status: {}", status.status);

    if !status.disk.is_empty() {
        out.push_str("Disks:\n");
        for (name, disk) in &status.disk {
            let _ = writeln!(out, " - {}: Used {}", name, format_size(disk.usage));
        }
    }
    let _ = writeln!(out, "Memory use: {}", format_size(status.memory.usage));
    let _ = writeln!(out, "Running processes: {}", status.processes);

    // Loopback alone is not worth a section
    let interfaces: Vec<_> = status.network.iter().filter(|(name, _)| *name != "lo").collect();
    if !interfaces.is_empty() {
        out.push_str("Network interfaces:\n");
        for (name, iface) in interfaces {
            let _ = writeln!(out, " - {} ({}):", name, iface.hwaddr);
            let _ = writeln!(
                out,
                "   Sent/received: {}/{}",
                format_size(iface.counters.bytes_sent),
                format_size(iface.counters.bytes_received)
            );
            for addr in &iface.addresses {
                let version = if addr.family == "inet6" { 6 } else { 4 };
                let _ = writeln!(out, "   IPv{} address: {}/{}", version, addr.address, addr.netmask);
            }
        }
    }
    out
}

pub fn render_config(config: &ContainerConfig) -> String {
    let mut out = String::from("Container configuration:\n");
    for (key, value) in config {
        let _ = writeln!(out, "{}: {}", key, value);
    }
    out
}

/// Ask a yes/no question; an empty answer picks `default` when there is one
pub fn ask<R: BufRead, W: Write>(
    question: &str,
    default: Option<bool>,
    input: &mut R,
    output: &mut W,
) -> io::Result<bool> {
    let prompt = match default {
        None => " [y/n] ",
        Some(true) => " [Y/n] ",
        Some(false) => " [y/N] ",
    };

    loop {
        write!(output, "{}{}", question, prompt)?;
        output.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            // No more input: only a default can answer
            return default.ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "No answer given")
            });
        }

        match line.trim().to_lowercase().as_str() {
            "" if default.is_some() => return Ok(default.unwrap_or(false)),
            "y" | "ye" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => writeln!(output, "Please respond with 'yes' or 'no' (or 'y' or 'n').")?,
        }
    }
}

/// Print `message`, run `f`, then finish the line with `done` on success
pub fn progress<T, E>(message: &str, done: &str, f: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
    print!("{}", message);
    let _ = io::stdout().flush();

    let result = f();
    match result {
        Ok(_) => println!("{}", done),
        Err(_) => println!(),
    }
    result
}
