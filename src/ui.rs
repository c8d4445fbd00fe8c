use colored::*;
use terminal_size::{terminal_size, Height, Width};

use crate::store::{Message, Role};

pub fn print_header(model: &str, endpoint: &str) {
    let (width, _) = terminal_size().unwrap_or((Width(80), Height(24)));
    let width = width.0 as usize;

    let line = "─".repeat(width);
    println!("{}", line.black().bold());

    let name = "Parley".cyan().bold();
    let version = format!("v{}", env!("CARGO_PKG_VERSION")).black().bold();
    println!("  {} {}", name, version);

    if !endpoint.is_empty() {
        println!("  {}", format!("{}  •  {}", model, endpoint).cyan());
    } else if !model.is_empty() {
        println!("  {}", model.cyan());
    }

    println!("{}", line.black().bold());
}

pub fn print_step(msg: &str) {
    println!("  {} {}", "•".green(), msg);
}

pub fn print_success(msg: &str) {
    println!("  {} {}", "✓".green().bold(), msg.green());
}

pub fn print_warning(msg: &str) {
    println!("  {} {}", "⚠️ ".yellow().bold(), msg.yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("  {} {}", "❌".red().bold(), msg.red());
}

pub fn print_thinking(msg: &str) {
    println!("  {} {}...", "∴".magenta(), msg);
}

/// One stored message, labelled by role.
pub fn print_message(message: &Message) {
    let label = match message.role {
        Role::User => "You".blue().bold(),
        Role::Assistant => "Bot".green().bold(),
        Role::System => "System".black().bold(),
    };
    println!("{}: {}", label, message.content);
}
