use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::debug;

use crate::blocklist::Blocklist;

/// Interactive management loop over the process's stdin/stdout.
///
/// Runs for the whole process lifetime, concurrently with the server;
/// mutations take the same lock the dispatcher reads under. Option 4 quiets
/// the menu until the operator presses enter again. Host entry is free text,
/// matching whatever the dispatcher extracts from requests.
pub async fn run(blocklist: Arc<Blocklist>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    print_menu();
    loop {
        let Some(choice) = read_line(&mut lines).await else {
            debug!("stdin closed, management console exiting");
            return;
        };

        match choice.trim() {
            "1" => {
                prompt("Host to block: ");
                let Some(host) = read_line(&mut lines).await else {
                    return;
                };
                let host = host.trim();
                if host.is_empty() {
                    println!("Nothing entered.");
                } else if blocklist.add(host) {
                    println!("{host} added to blocklist.");
                } else {
                    println!("{host} is already in the blocklist.");
                }
                print_menu();
            }
            "2" => {
                prompt("Host to unblock: ");
                let Some(host) = read_line(&mut lines).await else {
                    return;
                };
                let host = host.trim();
                if host.is_empty() {
                    println!("Nothing entered.");
                } else if blocklist.remove(host) {
                    println!("{host} removed from blocklist.");
                } else {
                    println!("{host} is not in the blocklist.");
                }
                print_menu();
            }
            "3" => {
                let entries = blocklist.entries();
                if entries.is_empty() {
                    println!("No hosts are blocked.");
                } else {
                    println!("Blocked hosts:");
                    for host in entries {
                        println!("  - {host}");
                    }
                }
                print_menu();
            }
            "4" => {
                println!("Resuming. Press enter to bring the menu back.");
            }
            "" => print_menu(),
            other => {
                println!("Invalid choice: {other}");
                print_menu();
            }
        }
    }
}

fn print_menu() {
    println!();
    println!("1. Add host to blocklist");
    println!("2. Remove host from blocklist");
    println!("3. Show blocked hosts");
    println!("4. Resume");
    prompt("Enter your choice: ");
}

fn prompt(text: &str) {
    use std::io::Write;
    print!("{text}");
    let _ = std::io::stdout().flush();
}

async fn read_line(lines: &mut Lines<BufReader<Stdin>>) -> Option<String> {
    match lines.next_line().await {
        Ok(Some(line)) => Some(line),
        Ok(None) => None,
        Err(e) => {
            debug!("management console read error: {e}");
            None
        }
    }
}
