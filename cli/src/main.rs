mod app;
mod commands;
mod terminal;

use app::App;
use commands::{CommandLine, Commands, config, plugins, report, run, scan};
use terminal::{logging, print};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let commands = CommandLine::parse_args();

    let mut app = App::load(&commands.config)?;
    logging::init(&app.cfg.get_or("logging.level", "info".to_string()));
    if !commands.no_banner {
        print::banner();
    }

    match commands.command {
        Commands::Scan { interface, network } => {
            print::header("starting network sweep");
            scan::scan(&mut app, &interface, &network).await
        }
        Commands::Watch {
            interface,
            network,
            interval,
        } => {
            print::header("starting continuous mapping");
            scan::watch(&mut app, &interface, &network, interval).await
        }
        Commands::Run {
            interface,
            network,
            stage,
        } => {
            print::header("starting assessment");
            run::run(&mut app, interface, network, stage).await
        }
        Commands::Report { run, format, output } => report::report(&mut app, run, format, output),
        Commands::Runs => report::runs(&mut app),
        Commands::Plugins => plugins::plugins(&mut app),
        Commands::Config { key, value } => config::config(&app, &key, value),
    }
}
