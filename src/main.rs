use std::path::PathBuf;
use std::process::ExitCode as ProcessExitCode;

use anyhow::{Context, Result, bail};
use argh::FromArgs;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use ship_shell::{ExitCode, HookEvent, Runnable, Shell, ShellConfig, pipe, program};

#[derive(FromArgs)]
/// Minimal interactive front end for the ship_shell execution core.
/// Words are split on whitespace and a standalone `|` separates pipeline stages.
struct Args {
    #[argh(option, short = 'c')]
    /// run one command line and exit with its status.
    command: Option<String>,

    #[argh(option, short = 'C')]
    /// start in this directory instead of the current one.
    directory: Option<PathBuf>,

    #[argh(switch)]
    /// start with an empty environment.
    no_inherit_env: bool,

    #[argh(switch, short = 'v')]
    /// log debug output to stderr.
    verbose: bool,
}

fn main() -> Result<ProcessExitCode> {
    let args: Args = argh::from_env();

    let filter = tracing_subscriber::EnvFilter::try_from_env("SHIP_LOG").unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if args.verbose { "debug" } else { "warn" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let mut config = ShellConfig::default().inherit_process_env(!args.no_inherit_env);
    if let Some(dir) = args.directory {
        config = config.initial_dir(dir);
    }
    let shell = Shell::new(config).context("failed to initialize shell")?;

    let code = match args.command {
        Some(line) => execute_line(&shell, &line),
        None => repl(&shell)?,
    };
    Ok(ProcessExitCode::from(process_status(code)))
}

/// Codes outside what a process can report become a plain failure.
fn process_status(code: ExitCode) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

/// Read-eval loop with history. Returns the status to exit with.
fn repl(shell: &Shell) -> Result<ExitCode> {
    let mut rl = DefaultEditor::new()?;
    loop {
        shell.hooks().dispatch(HookEvent::BeforePrompt);
        match rl.readline("ship$ ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                rl.add_history_entry(line)?;
                if let Some(code) = exit_request(line) {
                    return code;
                }
                execute_line(shell, line);
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => return Ok(shell.last_exit_code()),
            Err(err) => return Err(err.into()),
        }
    }
}

fn exit_request(line: &str) -> Option<Result<ExitCode>> {
    let mut words = line.split_whitespace();
    if words.next() != Some("exit") {
        return None;
    }
    Some(match words.next() {
        None => Ok(0),
        Some(code) => code
            .parse()
            .with_context(|| format!("exit: {code}: numeric argument required")),
    })
}

fn execute_line(shell: &Shell, line: &str) -> ExitCode {
    shell
        .hooks()
        .dispatch(HookEvent::BeforeExecute { statement: line });

    let code = match parse_line(line) {
        Ok(runnable) => match shell.run(&runnable) {
            Ok(result) => {
                for stage in &result.stages {
                    if let Some(err) = &stage.error {
                        eprintln!("ship: {err}");
                    }
                }
                result.exit_code
            }
            Err(err) => {
                eprintln!("ship: {err}");
                shell.last_exit_code()
            }
        },
        Err(err) => {
            eprintln!("ship: {err:#}");
            2
        }
    };

    shell
        .hooks()
        .dispatch(HookEvent::AfterExecute { statement: line });
    code
}

/// `a b | c d` becomes `pipe(a(b), c(d))`. No quoting, no expansion.
fn parse_line(line: &str) -> Result<Runnable> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let mut stages = Vec::new();
    for segment in words.split(|w| *w == "|") {
        let Some((name, args)) = segment.split_first() else {
            bail!("syntax error near `|`");
        };
        stages.push(program(*name).call(args.iter().copied()));
    }
    match stages.as_slice() {
        [] => bail!("empty command"),
        [single] => Ok(single.clone()),
        _ => Ok(pipe(&stages)?),
    }
}
