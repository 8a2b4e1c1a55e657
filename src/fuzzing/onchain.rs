//! On-chain mode support: the ABI store and runtime-bytecode adoption.
//!
//! ABIs for forked targets come from disk. The primary layout is one standard
//! ABI JSON per address under `abis/`; the fallback is a single `abi.json`
//! mapping addresses to bare signature lists, from which payable function
//! entries are synthesized.

use alloy::json_abi::{Function, JsonAbi, Param, StateMutability};
use alloy::primitives::Address;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::chain::TestChain;
use crate::error::{AbiError, ChainError, ConfigError, Result};
use crate::fuzzing::ContractDefinition;

pub const ABI_DIR: &str = "abis";
pub const ABI_FALLBACK_FILE: &str = "abi.json";

/// Load the ABI for one on-chain target address.
///
/// Looks for `abis/<lowercase address>.json` first; falls back to the
/// signature map in `abi.json`. A missing ABI is a typed error — the core is
/// never entered without one.
pub fn load_onchain_abi(base_dir: &Path, address: Address) -> Result<JsonAbi> {
    let address_key = format!("{address:#x}");
    let per_address_path = base_dir.join(ABI_DIR).join(format!("{address_key}.json"));

    if per_address_path.is_file() {
        let content = fs::read_to_string(&per_address_path).map_err(AbiError::Io)?;
        let abi = serde_json::from_str::<JsonAbi>(&content)
            .map_err(|err| AbiError::Malformed(format!("{}: {err}", per_address_path.display())))?;
        return Ok(abi);
    }

    let fallback_path = base_dir.join(ABI_FALLBACK_FILE);
    let content = fs::read_to_string(&fallback_path).map_err(|_| AbiError::MissingAbi {
        address: address_key.clone(),
        path: per_address_path.display().to_string(),
    })?;
    let all: HashMap<String, Vec<String>> = serde_json::from_str(&content)
        .map_err(|err| AbiError::Malformed(format!("{}: {err}", fallback_path.display())))?;
    let signatures = all
        .get(&address_key)
        .ok_or_else(|| AbiError::MissingEntry(address_key))?;
    Ok(synthesize_abi(signatures))
}

/// Build a minimal ABI from `name(type1,type2,…)` signatures. Every entry is
/// assumed payable (so value-carrying fuzz inputs are representable) with
/// arguments named `arg0, arg1, …`; invalid signatures are skipped.
fn synthesize_abi(signatures: &[String]) -> JsonAbi {
    let mut abi = JsonAbi::default();
    for signature in signatures {
        let Some((name, rest)) = signature.split_once('(') else {
            log::warn!("skipping malformed ABI signature `{signature}`");
            continue;
        };
        let types = rest.strip_suffix(')').unwrap_or(rest);
        let inputs: Vec<Param> = if types.is_empty() {
            Vec::new()
        } else {
            types
                .split(',')
                .enumerate()
                .map(|(index, ty)| Param {
                    ty: ty.trim().to_string(),
                    name: format!("arg{index}"),
                    components: Vec::new(),
                    internal_type: None,
                })
                .collect()
        };
        let function = Function {
            name: name.to_string(),
            inputs,
            outputs: Vec::new(),
            state_mutability: StateMutability::Payable,
        };
        abi.functions.entry(function.name.clone()).or_default().push(function);
    }
    abi
}

/// Adopt deployed runtime bytecode from chain state into the contract
/// definitions (whose names are target addresses in on-chain mode).
pub fn adopt_onchain_runtime(
    definitions: &mut [ContractDefinition],
    chain: &TestChain,
) -> Result<()> {
    for definition in definitions {
        let address: Address = definition.name.parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "on-chain target name `{}` is not an address",
                definition.name
            ))
        })?;
        let code = chain
            .code_at(address)
            .filter(|code| !code.is_empty())
            .ok_or(ChainError::MissingCode { address })?;
        definition.runtime_bytecode = code;
    }
    Ok(())
}
