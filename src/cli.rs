use crate::config::AppConfigOverrides;
use anyhow::{anyhow, bail, Context, Result};
use std::env;

const USAGE: &str = "Usage: asset_viewer [--width N] [--height N] [--vsync on|off] [--format EXT] \
[--auto-rotate on|off] [--controls on|off] [--background r,g,b[,a]] [--config PATH] <locator>";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CliOptions {
    pub locator: Option<String>,
    pub format_hint: Option<String>,
    pub config_path: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    vsync: Option<bool>,
    auto_rotate: Option<bool>,
    show_controls: Option<bool>,
    background_color: Option<[f32; 4]>,
}

impl CliOptions {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut options = CliOptions::default();
        let mut iter = args.into_iter();
        let _ = iter.next(); // program name
        while let Some(raw) = iter.next() {
            let arg = raw.as_ref();
            let Some(key) = arg.strip_prefix("--") else {
                if let Some(previous) = &options.locator {
                    bail!("Unexpected argument '{arg}'; '{previous}' is already the asset to view.\n{USAGE}");
                }
                options.locator = Some(arg.to_string());
                continue;
            };
            let value = iter.next().ok_or_else(|| anyhow!("Expected a value after '{arg}'"))?.as_ref().to_string();
            match key {
                "width" => {
                    options.width = Some(value.parse::<u32>().with_context(|| format!("Invalid width '{value}'"))?);
                }
                "height" => {
                    options.height = Some(value.parse::<u32>().with_context(|| format!("Invalid height '{value}'"))?);
                }
                "vsync" => options.vsync = Some(parse_bool_flag("vsync", &value)?),
                "auto-rotate" => options.auto_rotate = Some(parse_bool_flag("auto-rotate", &value)?),
                "controls" => options.show_controls = Some(parse_bool_flag("controls", &value)?),
                "background" => options.background_color = Some(parse_color(&value)?),
                "format" => options.format_hint = Some(value.trim_start_matches('.').to_string()),
                "config" => options.config_path = Some(value),
                _ => bail!("Unknown flag '{arg}'.\n{USAGE}"),
            }
        }
        Ok(options)
    }

    pub fn config_overrides(&self) -> AppConfigOverrides {
        AppConfigOverrides {
            width: self.width,
            height: self.height,
            vsync: self.vsync,
            auto_rotate: self.auto_rotate,
            show_controls: self.show_controls,
            background_color: self.background_color,
        }
    }
}

fn parse_bool_flag(flag: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => bail!("Invalid {flag} value '{other}'. Use on/off or true/false."),
    }
}

/// Components in 0..=1; alpha defaults to opaque.
fn parse_color(value: &str) -> Result<[f32; 4]> {
    let parts = value
        .split(',')
        .map(|part| part.trim().parse::<f32>().with_context(|| format!("Invalid color component '{part}'")))
        .collect::<Result<Vec<_>>>()?;
    let color = match parts.as_slice() {
        [r, g, b] => [*r, *g, *b, 1.0],
        [r, g, b, a] => [*r, *g, *b, *a],
        _ => bail!("Background color needs 3 or 4 components, got '{value}'"),
    };
    if color.iter().any(|c| !(0.0..=1.0).contains(c)) {
        bail!("Background color components must be between 0 and 1, got '{value}'");
    }
    Ok(color)
}
