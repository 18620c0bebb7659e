//! Interactive per-migration confirmation.

use std::io::Write;
use std::sync::Arc;

use yoyo_core::{ConfirmFn, Decision, Direction};

/// Builds the `[Ynaq]` prompt callback handed to the executor in
/// interactive mode.
pub fn confirm() -> ConfirmFn {
    Arc::new(|id: &str, direction: Direction| loop {
        print!("{} '{id}'? [Ynaq]: ", capitalize(direction.verb()));
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return Decision::Quit;
        }
        match line.trim().chars().next().map(|c| c.to_ascii_lowercase()) {
            None | Some('y') => return Decision::Yes,
            Some('n') => return Decision::No,
            Some('a') => return Decision::All,
            Some('q') => return Decision::Quit,
            Some(_) => {
                println!("y = yes, n = skip, a = yes to all, q = quit");
            }
        }
    })
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
