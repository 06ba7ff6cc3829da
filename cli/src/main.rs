// SPDX-License-Identifier: GPL-3.0-or-later
#![deny(clippy::all)]
#![deny(clippy::pedantic)]

use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use log::error;
use std::fs;
use tpm2_fapi::object::{set_key_flags, set_nv_flags};
use tpm2_fapi::path::{explicit_key_path, nv_start_index, to_disk_path};
use tpm2_fapi::policy::calculate;
use tpm2_fapi::types::{Algorithm, HashAlg};
use tpm2_fapi::{NoCallbacks, PolicyHarness};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Default profile for path expansion
    #[arg(short, long, default_value = "P_RSA2048SHA256")]
    profile: String,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Decode an algorithm identifier
    Alg {
        /// `TPM_ALG_ID` value
        #[arg(value_parser = maybe_hex::<u16>)]
        id: u16,
    },
    /// Expand a logical path
    Path {
        /// Logical FAPI path
        path: String,
    },
    /// Calculate the digest of a policy file
    Policy {
        /// Policy JSON file
        file: String,
        /// Hash algorithm
        #[arg(short = 'a', long, default_value = "sha256")]
        hash_alg: String,
    },
    /// Parse a key or NV template flag list
    Template {
        /// Comma-separated flags
        flags: String,
        /// Parse as an NV template
        #[arg(short, long)]
        nv: bool,
        /// Assume a policy is attached
        #[arg(long)]
        with_policy: bool,
    },
}

fn parse_hash_alg(name: &str) -> Option<HashAlg> {
    match name.to_ascii_lowercase().as_str() {
        "sha1" => Some(HashAlg::Sha1),
        "sha256" => Some(HashAlg::Sha256),
        "sha384" => Some(HashAlg::Sha384),
        "sha512" => Some(HashAlg::Sha512),
        _ => None,
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    match &cli.command {
        Commands::Alg { id } => match Algorithm::from_repr(*id) {
            Some(alg) => println!("{alg:?} {id:#06x}"),
            None => {
                error!("unknown algorithm {id:#06x}");
                std::process::exit(1);
            }
        },
        Commands::Path { path } => {
            if tpm2_fapi::path::path_type_p(path, tpm2_fapi::path::NV_PATH) {
                let base = nv_start_index(path).unwrap_or_else(|err| {
                    error!("{err}");
                    std::process::exit(1);
                });
                println!("{} (base {base:#010x})", to_disk_path(path));
            } else if tpm2_fapi::path::path_type_p(path, tpm2_fapi::path::POLICY_PATH) {
                println!("{}", to_disk_path(path));
            } else {
                let list = explicit_key_path(&cli.profile, path).unwrap_or_else(|err| {
                    error!("{err}");
                    std::process::exit(1);
                });
                println!("{}", list.join("/"));
            }
        }
        Commands::Policy { file, hash_alg } => {
            let Some(hash_alg) = parse_hash_alg(hash_alg) else {
                error!("unknown hash algorithm {hash_alg}");
                std::process::exit(1);
            };
            let text = fs::read_to_string(file).unwrap_or_else(|err| {
                error!("{err}");
                std::process::exit(1);
            });
            let mut harness: PolicyHarness = serde_json::from_str(&text).unwrap_or_else(|err| {
                error!("broken policy: {err}");
                std::process::exit(1);
            });
            let digest =
                calculate(&mut harness, hash_alg, &mut NoCallbacks).unwrap_or_else(|err| {
                    error!("{err}");
                    std::process::exit(1);
                });
            println!("{}", hex::encode(digest));
        }
        Commands::Template {
            flags,
            nv,
            with_policy,
        } => {
            if *nv {
                let template = set_nv_flags(flags, *with_policy).unwrap_or_else(|err| {
                    error!("{err}");
                    std::process::exit(1);
                });
                println!(
                    "attributes {:#010x} index {:#010x}",
                    template.attributes.bits(),
                    template.nv_index
                );
            } else {
                let template = set_key_flags(flags, *with_policy).unwrap_or_else(|err| {
                    error!("{err}");
                    std::process::exit(1);
                });
                println!(
                    "attributes {:#010x} persistent {:#010x}",
                    template.attributes.bits(),
                    template.persistent_handle
                );
            }
        }
    }
}
