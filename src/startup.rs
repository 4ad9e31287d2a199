// Startup module - displays banner and module loading status
//
// Runs before the pipeline starts so operators can see at a glance what
// is attached, where the Collector listens, and which store is in use.

use crate::config::{Config, VERSION};
use crate::hosts::HostTarget;

/// ANSI color codes for terminal output
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const CYAN: &str = "\x1b[36m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
    pub const MAGENTA: &str = "\x1b[35m";
}

/// Module loading result for display
pub struct ModuleStatus {
    pub name: &'static str,
    pub enabled: bool,
    pub description: &'static str,
}

/// Print the startup banner and module loading status
pub fn print_startup(config: &Config, target: &HostTarget) {
    use colors::*;

    println!();
    println!("  {BOLD}{CYAN}mcpspy{RESET} {DIM}v{VERSION}{RESET}");
    println!("  {DIM}Observation core for MCP server activity{RESET}");
    println!();

    if let Some(path) = Config::config_path() {
        if path.exists() {
            println!("  {DIM}Config:{RESET} {GREEN}ok{RESET} {}", path.display());
        } else {
            println!("  {DIM}Config:{RESET} {DIM}(using defaults){RESET}");
        }
    }
    println!("  {DIM}Target:{RESET} {BOLD}{}{RESET} ({})", target.name, target.description);
    println!();

    println!("  {DIM}Loading modules...{RESET}");
    for module in module_status(config) {
        print_module_status(&module);
    }
    println!();

    println!(
        "  {MAGENTA}>{RESET} Collector listening on {BOLD}{}{RESET}",
        config.collector_addr
    );
    println!(
        "  {MAGENTA}>{RESET} Event store at {BOLD}{}{RESET}",
        config.db_path.display()
    );
    if config.demo_mode {
        println!("  {YELLOW}>{RESET} {YELLOW}Demo mode active{RESET} {DIM}(synthetic trace){RESET}");
    }
    println!();
}

fn module_status(config: &Config) -> Vec<ModuleStatus> {
    vec![
        ModuleStatus {
            name: "graph",
            enabled: true,
            description: "Process tree tracking",
        },
        ModuleStatus {
            name: "registry",
            enabled: true,
            description: "MCP server identification",
        },
        ModuleStatus {
            name: "kernel",
            enabled: true,
            description: "Trace event capture",
        },
        ModuleStatus {
            name: "collector",
            enabled: true,
            description: "Producer fan-in",
        },
        ModuleStatus {
            name: "store",
            enabled: true,
            description: "SQLite event sink",
        },
        ModuleStatus {
            name: "netproxy",
            enabled: config.netproxy_enabled,
            description: "HTTP(S) interceptor feed",
        },
    ]
}

fn print_module_status(module: &ModuleStatus) {
    use colors::*;
    if module.enabled {
        println!(
            "    {GREEN}[ok]{RESET} {:<10} {DIM}{}{RESET}",
            module.name, module.description
        );
    } else {
        println!(
            "    {DIM}[--]{RESET} {DIM}{:<10} {}{RESET}",
            module.name, module.description
        );
    }
}
