use std::env;

/// ANSI palette for the interactive CLI surface.
struct Colors;

impl Colors {
    const MAIN: &'static str = "\x1b[38;2;95;173;235m";
    const SECONDARY: &'static str = "\x1b[38;2;74;155;217m";
    const DIM_GRAY: &'static str = "\x1b[38;2;128;128;128m";
    const ERROR: &'static str = "\x1b[38;2;255;59;48m";
    const RESET: &'static str = "\x1b[0m";
    const BOLD: &'static str = "\x1b[1m";
}

struct Symbols;

impl Symbols {
    const SUCCESS: &'static str = "✓";
    const ERROR: &'static str = "✗";
    const INFO: &'static str = "ℹ";
    const ARROW: &'static str = "→";
}

/// Human-facing output for the `init` flow. The service loop logs through
/// `tracing`; this is only for a person at a terminal.
pub struct Console;

impl Console {
    pub fn success(message: &str) {
        println!("{}", paint(Colors::MAIN, Symbols::SUCCESS, message));
    }

    pub fn error(message: &str) {
        eprintln!("{}", paint(Colors::ERROR, Symbols::ERROR, message));
    }

    pub fn info(message: &str) {
        println!("{}", paint(Colors::SECONDARY, Symbols::INFO, message));
    }

    /// Indented key → value line.
    pub fn detail(label: &str, value: &str) {
        if colors_enabled() {
            println!(
                "  {}{}{} {} {}{}{}",
                Colors::DIM_GRAY,
                label,
                Colors::RESET,
                Symbols::ARROW,
                Colors::SECONDARY,
                value,
                Colors::RESET
            );
        } else {
            println!("  {} {} {}", label, Symbols::ARROW, value);
        }
    }

    pub fn section(title: &str) {
        if colors_enabled() {
            println!("\n{}{}{}{}", Colors::BOLD, Colors::MAIN, title, Colors::RESET);
        } else {
            println!("\n{}", title);
        }
    }
}

fn paint(color: &str, symbol: &str, message: &str) -> String {
    if colors_enabled() {
        format!("{}{} {}{}", color, symbol, message, Colors::RESET)
    } else {
        format!("{} {}", symbol, message)
    }
}

fn colors_enabled() -> bool {
    env::var("NO_COLOR").is_err() && console::Term::stdout().is_term()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_methods_dont_panic() {
        Console::success("test");
        Console::error("test");
        Console::info("test");
        Console::detail("key", "value");
        Console::section("Section");
    }
}
