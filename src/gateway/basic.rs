//! The `basic` product contract, hosted by the in-memory ledger.
//!
//! | function                      | kind     | result                         |
//! |-------------------------------|----------|--------------------------------|
//! | `InitLedger`                  | submit   | empty; fails if run twice      |
//! | `CreateProduct(name, desc)`   | submit   | the new product as JSON        |
//! | `QueryProduct(id)`            | evaluate | one product as JSON            |
//! | `QueryAllProducts`            | evaluate | JSON array in creation order   |
//! | `GetSubmittingClientIdentity` | evaluate | caller's MSP, id, attributes   |
//!
//! Products are keyed `product~` plus a sequential id zero-padded to the width
//! of `u64::MAX`, so a key-ordered scan returns them in commit order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::memory::{Chaincode, TxContext};

const PRODUCT_PREFIX: &str = "product~";
const NEXT_ID_KEY: &str = "meta~next_id";
const INITIALIZED_KEY: &str = "meta~initialized";

/// Error message returned by a repeated `InitLedger`.
pub const ALREADY_INITIALIZED: &str = "ledger already initialized";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Enrollment id of the creator.
    pub owner: String,
    pub owner_msp: String,
    /// Transaction that created the product.
    pub tx_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmittingClient<'a> {
    msp_id: &'a str,
    id: &'a str,
    attributes: &'a BTreeMap<String, String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProductContract;

impl Chaincode for ProductContract {
    fn invoke(&self, ctx: &mut TxContext<'_>, function: &str, args: &[String]) -> Result<Vec<u8>, String> {
        match (function, args) {
            ("InitLedger", []) => init_ledger(ctx),
            ("CreateProduct", [name, description]) => create_product(ctx, name, description),
            ("QueryProduct", [id]) => query_product(ctx, id),
            ("QueryAllProducts", []) => query_all(ctx),
            ("GetSubmittingClientIdentity", []) => submitting_client(ctx),
            ("InitLedger" | "CreateProduct" | "QueryProduct" | "QueryAllProducts" | "GetSubmittingClientIdentity", _) => {
                Err(format!("{function}: wrong number of arguments ({})", args.len()))
            }
            _ => Err(format!("function {function} is not defined in contract basic")),
        }
    }
}

fn init_ledger(ctx: &mut TxContext<'_>) -> Result<Vec<u8>, String> {
    if ctx.get_state(INITIALIZED_KEY).is_some() {
        return Err(ALREADY_INITIALIZED.to_string());
    }
    let stamp = ctx.timestamp().to_rfc3339();
    ctx.put_state(INITIALIZED_KEY, stamp.into_bytes());
    if ctx.get_state(NEXT_ID_KEY).is_none() {
        ctx.put_state(NEXT_ID_KEY, b"1".to_vec());
    }
    Ok(Vec::new())
}

fn next_id(ctx: &TxContext<'_>) -> Result<u64, String> {
    match ctx.get_state(NEXT_ID_KEY) {
        None => Ok(1),
        Some(raw) => String::from_utf8(raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| "corrupt product counter".to_string()),
    }
}

fn product_key(id: u64) -> String {
    format!("{PRODUCT_PREFIX}{id:020}")
}

fn create_product(ctx: &mut TxContext<'_>, name: &str, description: &str) -> Result<Vec<u8>, String> {
    if name.trim().is_empty() {
        return Err("product name must not be empty".into());
    }
    let id = next_id(ctx)?;
    let client = ctx.client_identity();
    let product = Product {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        owner: client.enrollment_id.clone(),
        owner_msp: client.msp_id.clone(),
        tx_id: ctx.transaction_id().to_string(),
    };
    let bytes = serde_json::to_vec(&product).map_err(|e| e.to_string())?;
    ctx.put_state(&product_key(id), bytes.clone());
    ctx.put_state(NEXT_ID_KEY, (id + 1).to_string().into_bytes());
    Ok(bytes)
}

fn query_product(ctx: &TxContext<'_>, id: &str) -> Result<Vec<u8>, String> {
    let n: u64 = id.trim().parse().map_err(|_| format!("product id '{id}' is not a number"))?;
    ctx.get_state(&product_key(n))
        .ok_or_else(|| format!("product {id} does not exist"))
}

fn query_all(ctx: &TxContext<'_>) -> Result<Vec<u8>, String> {
    let mut products = Vec::new();
    for key in ctx.keys_with_prefix(PRODUCT_PREFIX) {
        let Some(raw) = ctx.get_state(&key) else { continue };
        let product: Product = serde_json::from_slice(&raw).map_err(|e| format!("corrupt record {key}: {e}"))?;
        products.push(product);
    }
    serde_json::to_vec(&products).map_err(|e| e.to_string())
}

fn submitting_client(ctx: &TxContext<'_>) -> Result<Vec<u8>, String> {
    let client = ctx.client_identity();
    serde_json::to_vec(&SubmittingClient {
        msp_id: &client.msp_id,
        id: &client.id,
        attributes: &client.attributes,
    })
    .map_err(|e| e.to_string())
}
