//! core cli commands

use std::io::{self, Write};

use crate::{config::parse_port_offset, Result};

// ── Menu ──

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MenuAction {
    Install,
    DownloadSnapshot,
    CheckSync,
    ViewLogs,
    Exit,
}

impl MenuAction {
    pub const ALL: [MenuAction; 5] = [
        MenuAction::Install,
        MenuAction::DownloadSnapshot,
        MenuAction::CheckSync,
        MenuAction::ViewLogs,
        MenuAction::Exit,
    ];

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "1" => Some(MenuAction::Install),
            "2" => Some(MenuAction::DownloadSnapshot),
            "3" => Some(MenuAction::CheckSync),
            "4" => Some(MenuAction::ViewLogs),
            "5" => Some(MenuAction::Exit),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MenuAction::Install => "Install node",
            MenuAction::DownloadSnapshot => "Download snapshot",
            MenuAction::CheckSync => "Check sync status",
            MenuAction::ViewLogs => "View logs",
            MenuAction::Exit => "Exit",
        }
    }
}

pub fn print_menu() {
    tracing::info!("=== Node Pilot ===\n");
    for (i, action) in MenuAction::ALL.iter().enumerate() {
        tracing::info!("  {}. {}", i + 1, action.label());
    }
}

// ── Interactive helpers ──

pub fn read_input<I>(lines: &mut I, prompt: &str, default: Option<&str>) -> io::Result<String>
where
    I: Iterator<Item = io::Result<String>>,
{
    if let Some(def) = default {
        // Show default as a dim placeholder on the input line
        tracing::info!("  {}", prompt);
        print!("  \x1b[2m{}\x1b[0m > ", def);
    } else {
        print!("  {}: ", prompt);
    }
    io::stdout().flush()?;
    let input = lines.next().unwrap_or(Ok(String::new()))?;
    let input = input.trim().to_string();
    if input.is_empty() {
        if let Some(def) = default {
            return Ok(def.to_string());
        }
    }
    Ok(input)
}

pub fn prompt_continue<I>(lines: &mut I, question: &str) -> io::Result<bool>
where
    I: Iterator<Item = io::Result<String>>,
{
    print!("  {} [Y/n]: ", question);
    io::stdout().flush()?;
    let answer = lines.next().unwrap_or(Ok(String::new()))?;
    let answer = answer.trim().to_lowercase();
    Ok(answer.is_empty() || answer == "y" || answer == "yes")
}

/// Ask for the node name until a non-empty one is given. Returns an error
/// when stdin closes before that.
pub fn prompt_moniker<I>(lines: &mut I) -> Result<String>
where
    I: Iterator<Item = io::Result<String>>,
{
    loop {
        print!("  Node name (moniker): ");
        io::stdout().flush()?;
        let Some(line) = lines.next() else {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no node name given").into());
        };
        let name = line?.trim().to_string();
        if !name.is_empty() {
            return Ok(name);
        }
        tracing::info!("  Node name cannot be empty.");
    }
}

pub fn prompt_port_offset<I>(lines: &mut I) -> Result<u16>
where
    I: Iterator<Item = io::Result<String>>,
{
    let raw = read_input(lines, "Port offset (0 keeps default ports)", Some("0"))?;
    parse_port_offset(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(input: &[&str]) -> impl Iterator<Item = io::Result<String>> {
        input
            .iter()
            .map(|s| Ok(s.to_string()))
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn menu_choices_map_to_actions() {
        assert_eq!(MenuAction::parse("1"), Some(MenuAction::Install));
        assert_eq!(MenuAction::parse(" 5 "), Some(MenuAction::Exit));
        assert_eq!(MenuAction::parse("6"), None);
        assert_eq!(MenuAction::parse("install"), None);
    }

    #[test]
    fn read_input_falls_back_to_default() {
        let mut input = lines(&["", "  typed  "]);
        assert_eq!(read_input(&mut input, "q", Some("d")).unwrap(), "d");
        assert_eq!(read_input(&mut input, "q", Some("d")).unwrap(), "typed");
        assert_eq!(read_input(&mut input, "q", None).unwrap(), "");
    }

    #[test]
    fn moniker_reprompts_on_empty() {
        let mut input = lines(&["", "   ", "validator-1"]);
        assert_eq!(prompt_moniker(&mut input).unwrap(), "validator-1");
    }

    #[test]
    fn moniker_fails_on_closed_stdin() {
        let mut input = lines(&[""]);
        assert!(prompt_moniker(&mut input).is_err());
    }

    #[test]
    fn port_offset_prompt() {
        assert_eq!(prompt_port_offset(&mut lines(&[""])).unwrap(), 0);
        assert_eq!(prompt_port_offset(&mut lines(&["200"])).unwrap(), 200);
        assert!(prompt_port_offset(&mut lines(&["abc"])).is_err());
    }
}
