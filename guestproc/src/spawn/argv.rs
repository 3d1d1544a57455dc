//! Command line and environment marshalling for host exec.

/// Host variables always taken from the real environment, never from the
/// emulated block. The installation prefix variable is added at call time.
pub const CARRIED_HOST_VARIABLES: [&str; 2] = ["PATH", "HOME"];

/// Split a command line into an argument vector.
///
/// A double-quoted token at the very start is kept whole with its quotes
/// stripped. Everything else is split on whitespace; quotes elsewhere are
/// ordinary characters. An unterminated leading quote leaves the whole line
/// to the whitespace split.
pub fn build_argv(command_line: &str) -> Vec<String> {
    let mut argv = Vec::new();
    let mut rest = command_line;
    if let Some(quoted) = command_line.strip_prefix('"') {
        if let Some(end) = quoted.find('"') {
            argv.push(quoted[..end].to_string());
            rest = &quoted[end + 1..];
        }
    }
    argv.extend(rest.split_ascii_whitespace().map(str::to_string));
    argv
}

/// Join an argument vector back into a command line, quoting the program
/// name when it contains a space.
pub fn build_command_line(argv: &[String]) -> String {
    let mut line = String::new();
    for (index, arg) in argv.iter().enumerate() {
        if index > 0 {
            line.push(' ');
        }
        if index == 0 && arg.contains(' ') {
            line.push('"');
            line.push_str(arg);
            line.push('"');
        } else {
            line.push_str(arg);
        }
    }
    line
}

/// Name part of a `NAME=value` entry.
pub fn variable_name(entry: &str) -> &str {
    entry.split_once('=').map_or(entry, |(name, _)| name)
}

/// Build the environment vector handed to exec.
///
/// Order: `extra` first, then `PATH`, `HOME` and `prefix_variable` from the
/// host (via `host_lookup`), then the emulated `environment` minus those
/// three names. Exec consumers take the first occurrence of a name, so
/// `extra` overrides everything.
pub fn build_envp<F>(
    environment: &[String],
    extra: &[String],
    host_lookup: F,
    prefix_variable: &str,
) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    let carried: Vec<&str> = CARRIED_HOST_VARIABLES
        .iter()
        .copied()
        .chain(std::iter::once(prefix_variable))
        .collect();

    let mut envp: Vec<String> = extra.to_vec();
    for name in &carried {
        if let Some(value) = host_lookup(name) {
            envp.push(format!("{name}={value}"));
        }
    }
    envp.extend(
        environment
            .iter()
            .filter(|entry| !carried.contains(&variable_name(entry)))
            .cloned(),
    );
    envp
}
