use clap::Command;

pub(super) fn root_cli() -> Command {
    Command::new("auditship")
        .about("Ships the Cloudflare organization audit log to stdout as JSON lines")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(add_run_subcommand())
        .subcommand(add_once_subcommand())
}

fn add_run_subcommand() -> Command {
    Command::new("run").about("Runs a tick every interval and serves metrics until stopped")
}

fn add_once_subcommand() -> Command {
    Command::new("once").about("Runs a single tick and exits with its result")
}
