//! Ordo CLI Client
//!
//! Interactive command-line client for Ordo servers.
//!
//! # Usage
//!
//! ```bash
//! # Connect to local server
//! ordo
//!
//! # Connect to remote server
//! ordo --host example.com --port 7400
//!
//! # Execute single command
//! ordo -c "NODES"
//!
//! # Join a document and print its sequenced stream until interrupted
//! ordo -c "CONNECT acme notes" --follow
//! ```

use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::*;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(50);

/// Ordo Command Line Interface
#[derive(Parser, Debug)]
#[command(name = "ordo")]
#[command(author, version, about = "Ordo CLI - operation ordering service client")]
struct Args {
    /// Server hostname
    #[arg(short = 'H', long, default_value = "127.0.0.1", env = "ORDO_HOST")]
    host: String,

    /// Server port
    #[arg(short, long, default_value = "7400", env = "ORDO_PORT")]
    port: u16,

    /// Execute command and exit
    #[arg(short, long)]
    command: Option<String>,

    /// After --command, keep printing sequenced messages
    #[arg(short, long, requires = "command")]
    follow: bool,

    /// Quiet mode (no banner)
    #[arg(short, long)]
    quiet: bool,
}

/// One server connection plus what the client has seen on it
struct Session {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    /// Bytes of a line cut short by a read timeout
    pending: String,
    /// Highest sequence number pushed so far
    last_seen: i64,
    /// Next client sequence number for SEND
    next_csn: i64,
}

impl Session {
    fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).with_context(|| format!("Failed to connect to {}", addr))?;
        stream.set_read_timeout(Some(REPLY_TIMEOUT))?;
        let reader = BufReader::new(stream.try_clone()?);

        Ok(Self {
            stream,
            reader,
            pending: String::new(),
            last_seen: 0,
            next_csn: 1,
        })
    }

    /// Read one full line, keeping partial data across timeouts
    fn read_line(&mut self) -> io::Result<String> {
        let n = self.reader.read_line(&mut self.pending)?;
        if n == 0 && self.pending.is_empty() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "server closed the connection"));
        }
        let line = std::mem::take(&mut self.pending);
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Print sequenced messages that arrived between commands
    fn drain_pushes(&mut self) -> Result<()> {
        self.stream.set_read_timeout(Some(DRAIN_TIMEOUT))?;
        let result = loop {
            match self.read_line() {
                Ok(line) => self.print_push(&line),
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => break Ok(()),
                Err(e) => break Err(e.into()),
            }
        };
        self.stream.set_read_timeout(Some(REPLY_TIMEOUT))?;
        result
    }

    /// Print pushes until the connection closes
    fn follow(&mut self) -> Result<()> {
        self.stream.set_read_timeout(None)?;
        loop {
            let line = self.read_line()?;
            self.print_push(&line);
        }
    }

    fn execute(&mut self, cmd: &str) -> Result<()> {
        // Pushes already queued belong before this command's reply
        self.drain_pushes()?;

        if cmd.to_uppercase().starts_with("CONNECT") {
            self.next_csn = 1;
        }

        writeln!(self.stream, "{}", cmd)?;
        self.stream.flush()?;

        loop {
            let line = self.read_line()?;
            if line.starts_with('#') {
                self.print_push(&line);
                continue;
            }
            return self.print_reply(&line, "");
        }
    }

    /// SEND <json>: SUBMIT with tracked sequence numbers
    fn send(&mut self, contents: &str) -> Result<()> {
        let contents = contents.trim();
        if contents.is_empty() {
            bail!("SEND requires a JSON value");
        }
        self.drain_pushes()?;
        let cmd = format!("SUBMIT {} {} {}", self.next_csn, self.last_seen, contents);
        self.next_csn += 1;
        self.execute(&cmd)
    }

    fn print_reply(&mut self, line: &str, indent: &str) -> Result<()> {
        if line.starts_with("+OK") {
            println!("{}{}", indent, line.green());
        } else if line == "+PONG" {
            println!("{}{}", indent, "PONG".green());
        } else if line.starts_with("-ERR") {
            println!("{}{}", indent, line.red());
        } else if let Some(n) = line.strip_prefix(':') {
            println!("{}{}", indent, n.yellow());
        } else if line == "$-1" {
            println!("{}{}", indent, "(nil)".dimmed());
        } else if line.starts_with('$') {
            let data = self.read_line()?;
            println!("{}{}", indent, pretty(&data));
        } else if let Some(count) = line.strip_prefix('*') {
            let count: usize = count.parse().with_context(|| format!("bad array header {}", line))?;
            if count == 0 {
                println!("{}{}", indent, "(empty array)".dimmed());
            }
            for i in 0..count {
                let item = self.read_line()?;
                print!("{}{}) ", indent, i + 1);
                self.print_reply(&item, "")?;
            }
        } else {
            println!("{}{}", indent, line);
        }
        Ok(())
    }

    fn print_push(&mut self, line: &str) {
        let Some(rest) = line.strip_prefix('#') else {
            println!("{}", line);
            return;
        };
        let (seq, data) = rest.split_once(' ').unwrap_or((rest, ""));
        if let Ok(seq) = seq.parse::<i64>() {
            self.last_seen = self.last_seen.max(seq);
        }
        println!("{} {}", format!("#{}", seq).blue(), data);
    }
}

fn pretty(data: &str) -> String {
    serde_json::from_str::<serde_json::Value>(data)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| data.to_string())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let addr = format!("{}:{}", args.host, args.port);
    let mut session = Session::connect(&addr)?;

    // Single command mode
    if let Some(cmd) = args.command {
        session.execute(&cmd)?;
        if args.follow {
            session.follow()?;
        }
        return Ok(());
    }

    if !args.quiet {
        println!(
            "{}",
            format!(
                r#"
  ╔═╗╦═╗╔╦╗╔═╗  CLI
  ║ ║╠╦╝ ║║║ ║  Connected to {}
  ╚═╝╩╚══╩╝╚═╝  Type 'help' for commands, 'quit' to exit
"#,
                addr
            )
            .cyan()
        );
    }

    // Interactive mode
    let mut rl = DefaultEditor::new()?;
    let history_path = dirs_next::home_dir()
        .map(|p| p.join(".ordo_history"))
        .unwrap_or_default();

    let _ = rl.load_history(&history_path);

    loop {
        if let Err(e) = session.drain_pushes() {
            eprintln!("{} {}", "Error:".red(), e);
        }

        let prompt = format!("{}> ", "ordo".green());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(line);

                let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
                let result = match head.to_uppercase().as_str() {
                    "QUIT" | "EXIT" => {
                        let _ = session.execute("QUIT");
                        break;
                    }
                    "HELP" => {
                        print_help();
                        continue;
                    }
                    "CLEAR" => {
                        print!("\x1B[2J\x1B[1;1H");
                        continue;
                    }
                    "SEND" => session.send(rest),
                    _ => session.execute(line),
                };

                if let Err(e) = result {
                    eprintln!("{} {}", "Error:".red(), e);

                    // Try to reconnect; the server has already sent a Leave for us
                    match Session::connect(&addr) {
                        Ok(new_session) => {
                            session = new_session;
                            println!("{}", "Reconnected. CONNECT again to rejoin a document.".yellow());
                        }
                        Err(_) => {
                            eprintln!("{}", "Connection lost.".red());
                            break;
                        }
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    Ok(())
}

fn print_help() {
    println!(
        r#"
{}

{}
  CONNECT <tenant> <doc> [USER <json>] [CLIENT <json>]
                                         Join a document's sequenced stream
  SUBMIT <csn> <rsn> <json>              Submit an operation
  DISCONNECT                             Leave the document

{}
  PING                                   Check connection
  INFO                                   Session and routing information
  NODES                                  Live nodes in the fleet
  QUIT                                   Close connection

{}
  send <json>                            SUBMIT with tracked csn/rsn
  help                                   Show this help
  clear                                  Clear screen
  quit/exit                              Exit CLI

Sequenced messages are printed as {} as they arrive.
"#,
        "Ordo Commands".cyan().bold(),
        "Documents".yellow().bold(),
        "Server".yellow().bold(),
        "Local".yellow().bold(),
        "#<seq> <json>".blue(),
    );
}

// Minimal dirs_next replacement for home directory
mod dirs_next {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
    }
}
