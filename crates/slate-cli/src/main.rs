use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use slate_cli::{mirror, run_simulator, SimulatorConfig};
use slate_core::{SlateConfig, UserId};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    let dir = Arg::new("dir")
        .long("dir")
        .value_parser(value_parser!(PathBuf))
        .help("Mirror directory (defaults to the configured one)");
    let user = Arg::new("user")
        .long("user")
        .required(true)
        .help("User whose collections to act on");
    let config = Arg::new("config")
        .long("config")
        .global(true)
        .value_parser(value_parser!(PathBuf))
        .help("TOML configuration file");

    Command::new("slate")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Navy Slate sync tooling")
        .arg(config)
        .subcommand_required(true)
        .subcommand(
            Command::new("simulate")
                .about("Run a seeded workload against the in-memory backend")
                .arg(
                    Arg::new("operations")
                        .long("operations")
                        .default_value("200")
                        .value_parser(value_parser!(u64))
                        .help("Number of operations to run"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("fail-every")
                        .long("fail-every")
                        .default_value("5")
                        .value_parser(value_parser!(u64))
                        .help("Fail every n-th backend write (0 disables)"),
                )
                .arg(
                    Arg::new("seed-tasks")
                        .long("seed-tasks")
                        .default_value("8")
                        .value_parser(value_parser!(usize))
                        .help("Tasks in the starting data set"),
                )
                .arg(
                    Arg::new("stop-on-violation")
                        .long("stop-on-violation")
                        .action(ArgAction::SetTrue)
                        .help("Stop at the first failed check"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output the report as JSON"),
                ),
        )
        .subcommand(
            Command::new("mirror")
                .about("Inspect or clear the local mirror")
                .subcommand_required(true)
                .subcommand(
                    Command::new("inspect")
                        .about("List mirrored collections")
                        .arg(dir.clone())
                        .arg(user.clone()),
                )
                .subcommand(
                    Command::new("clear")
                        .about("Remove every mirrored collection of a user")
                        .arg(dir)
                        .arg(user),
                ),
        )
        .subcommand(
            Command::new("config").about("Print the effective configuration").arg(
                Arg::new("file")
                    .long("file")
                    .value_parser(value_parser!(PathBuf))
                    .help("TOML configuration file to show (overrides --config)"),
            ),
        )
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<SlateConfig> {
    match path {
        Some(path) => SlateConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(SlateConfig::default()),
    }
}

async fn simulate(args: &ArgMatches) -> anyhow::Result<bool> {
    let config = SimulatorConfig {
        operations: args.get_one::<u64>("operations").copied().unwrap_or(200),
        seed: args.get_one::<u64>("seed").copied().unwrap_or(42),
        fail_every: args.get_one::<u64>("fail-every").copied().unwrap_or(5),
        seed_tasks: args.get_one::<usize>("seed-tasks").copied().unwrap_or(8),
        stop_on_violation: args.get_flag("stop-on-violation"),
    };

    let report = run_simulator(config).await?;
    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.generate_text());
    }
    Ok(report.passed())
}

async fn mirror_command(config: &SlateConfig, matches: &ArgMatches) -> anyhow::Result<()> {
    let Some((action, args)) = matches.subcommand() else {
        anyhow::bail!("missing mirror action");
    };
    let dir = args
        .get_one::<PathBuf>("dir")
        .cloned()
        .unwrap_or_else(|| config.mirror.dir.clone());
    let user = args
        .get_one::<String>("user")
        .map(UserId::new)
        .context("--user is required")?;
    let store = mirror::open(&dir, config.mirror.ttl());

    match action {
        "inspect" => {
            let entries = mirror::inspect(&store, &user)
                .await
                .with_context(|| format!("reading {}", dir.display()))?;
            print!("{}", mirror::render(&user, &entries));
        }
        "clear" => {
            let removed = mirror::clear(&store, &user)
                .await
                .with_context(|| format!("clearing {}", dir.display()))?;
            println!("Removed {removed} mirrored collections for {user}");
        }
        other => anyhow::bail!("unknown mirror action {other}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let matches = cli().get_matches();
    let config = load_config(matches.get_one::<PathBuf>("config"))?;

    match matches.subcommand() {
        Some(("simulate", args)) => {
            let passed = simulate(args).await?;
            std::process::exit(if passed { 0 } else { 1 });
        }
        Some(("mirror", args)) => mirror_command(&config, args).await?,
        Some(("config", args)) => {
            let config = match args.get_one::<PathBuf>("file") {
                Some(path) => load_config(Some(path))?,
                None => config,
            };
            print!("{}", config.to_toml_string()?);
        }
        _ => {}
    }
    Ok(())
}
