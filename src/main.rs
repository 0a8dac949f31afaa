use std::io::{self, Write};

use clap::Parser;
use ledgerchain::config::{self, Cli};
use ledgerchain::{Amount, Ledger, LedgerError, Outcome, Receipt};

const HELP: &str = "\
Available commands:
  create <id>                   open an account
  address <id>                  show the account address
  balance <id>                  show the account balance
  fund <admin> <id> <amount>    add funds (administrators only)
  transfer <from> <to> <amount> move funds between accounts
  validate                      check chain integrity
  state                         show the chain tip
  history                       list every transaction
  accounts                      list accounts and balances
  log                           list block timestamps and digests
  flags                         assess transactions for unusually high amounts
  help, exit
Identifiers may not contain spaces here, e.g. +1-555-0100.";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    config::init_tracing(&cli.log_level);

    let ledger = Ledger::open(cli.open_storage()?)?;
    println!("Ledger is ready. Type 'help' for commands.");

    let mut input = String::new();
    loop {
        print!("> ");
        io::stdout().flush()?;
        input.clear();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let words: Vec<&str> = input.split_whitespace().collect();

        match words.as_slice() {
            [] => {}
            ["exit"] => break,
            ["help"] => println!("{HELP}"),
            ["create", id] => render(ledger.create_account(id)),
            ["address", id] => match ledger.account(id) {
                Ok(account) => println!("Your address is: {}", account.id()),
                Err(_) => println!("Create an account first with 'create {id}'."),
            },
            ["balance", id] => match ledger.balance(id) {
                Ok(balance) => println!("Balance of {id}: {balance:.2}"),
                Err(e) => println!("Error: {e}"),
            },
            ["fund", admin, id, amount] => {
                if !cli.is_admin(admin) {
                    println!("Error: {admin} is not allowed to add funds.");
                    continue;
                }
                match amount.parse::<Amount>() {
                    Ok(amount) => render(ledger.add_funds(admin, id, amount.value())),
                    Err(e) => println!("Error: {e}"),
                }
            }
            ["transfer", from, to, amount] => match amount.parse::<Amount>() {
                Ok(amount) => render(ledger.transfer_funds(from, to, amount.value())),
                Err(e) => println!("Error: {e}"),
            },
            ["validate"] => println!("{}", ledger.validate_chain()),
            ["state"] => {
                let state = ledger.chain_state();
                println!(
                    "Block #{} ({}), {} accounts, total supply {:.2}",
                    state.latest_block_index,
                    state.latest_block_hash,
                    state.account_count,
                    state.total_supply
                );
            }
            ["history"] => {
                let history = ledger.history();
                if history.is_empty() {
                    println!("No transactions yet.");
                }
                for record in history {
                    println!("{record}");
                }
            }
            ["accounts"] => {
                for account in ledger.accounts() {
                    println!("{}: {:.2}", account.id(), account.balance());
                }
            }
            ["log"] => {
                for entry in ledger.block_log() {
                    println!("{entry}");
                }
            }
            ["flags"] => {
                for flagged in ledger.flag_outliers() {
                    println!("{}: {}", flagged.record, flagged.assessment);
                }
            }
            _ => println!("Unknown command: {}. Type 'help' for commands.", input.trim()),
        }
    }

    println!("Exiting.");
    Ok(())
}

fn render(result: Result<Receipt, LedgerError>) {
    let outcome = Outcome::from(result);
    if !outcome.success {
        println!("Error: {}", outcome.message);
        return;
    }
    match outcome.digest {
        Some(digest) => println!("{} Block {digest}", outcome.message),
        None => println!("{}", outcome.message),
    }
}
