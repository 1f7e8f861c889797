//! Parsing of terminal input lines.

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Plain text, multicast to everyone.
    Broadcast(String),
    /// `/msg <name> <text>`
    Private { to: String, content: String },
    /// `/name <new>`
    Rename(String),
    /// `/peers`
    Peers,
    /// `/typing on|off [name]`
    Typing { on: bool, to: Option<String> },
    /// `/quit`
    Quit,
    /// Blank line.
    Empty,
}

/// Parse a line of input. Errors carry a usage hint for the user.
pub fn parse(line: &str) -> Result<Command, String> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(Command::Empty);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Broadcast(line.to_string()));
    };

    let (cmd, args) = match rest.split_once(char::is_whitespace) {
        Some((cmd, args)) => (cmd, args.trim()),
        None => (rest, ""),
    };

    match cmd {
        "msg" => match args.split_once(char::is_whitespace) {
            Some((to, content)) if !content.trim().is_empty() => Ok(Command::Private {
                to: to.to_string(),
                content: content.trim_start().to_string(),
            }),
            _ => Err("usage: /msg <name> <text>".into()),
        },
        "name" if !args.is_empty() => Ok(Command::Rename(args.to_string())),
        "name" => Err("usage: /name <new name>".into()),
        "peers" => Ok(Command::Peers),
        "typing" => {
            let mut parts = args.split_whitespace();
            let on = match parts.next() {
                Some("on") => true,
                Some("off") => false,
                _ => return Err("usage: /typing on|off [name]".into()),
            };
            Ok(Command::Typing {
                on,
                to: parts.next().map(str::to_string),
            })
        }
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(format!("unknown command /{other}")),
    }
}
