//! Join-flow simulator
//!
//! Crafts a properly MIC'd Join-Request PHY payload, wraps it in a
//! Backend Interfaces JoinReq document, POSTs it to a running join
//! server, and prints the answer. Useful for poking a server without a
//! network server in front of it.
//!
//! The device identity below must be provisioned on the server:
//!   dev_eui = "0102030405060708"
//!   nwk_key = "01020304050607080102030405060708"
//!
//! Usage: cargo run --bin join-sim [server_url]

use std::env;

use lora_joinserver::lorawan::keys::{Aes128Key, Eui64};
use lora_joinserver::lorawan::JoinRequestPayload;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let server_url = env::args()
        .nth(1)
        .unwrap_or_else(|| "http://127.0.0.1:8003/".to_string());

    let dev_eui: Eui64 = "0102030405060708".parse()?;
    let join_eui: Eui64 = "0807060504030201".parse()?;
    let nwk_key: Aes128Key = "01020304050607080102030405060708".parse()?;
    let dev_nonce: u16 = 258;

    let mut join_request = JoinRequestPayload {
        join_eui,
        dev_eui,
        dev_nonce,
        mic: [0; 4],
    };
    join_request.mic = join_request.compute_mic(&nwk_key);
    let phy = join_request.to_bytes();

    let request = serde_json::json!({
        "ProtocolVersion": "1.0",
        "SenderID": "010203",
        "ReceiverID": join_eui.to_string(),
        "TransactionID": 1u32,
        "MessageType": "JoinReq",
        "MACVersion": "1.0.3",
        "PHYPayload": hex::encode(phy),
        "DevEUI": dev_eui.to_string(),
        "DevAddr": "01020304",
        "DLSettings": "00",
        "RxDelay": 1,
    });

    println!("📡 POSTing JoinReq to {}", server_url);
    println!("   DevEUI: {}  DevNonce: {}", dev_eui, dev_nonce);
    println!("   PHY: {}", hex::encode(phy));
    println!();

    let client = reqwest::Client::new();
    let response = client.post(&server_url).json(&request).send().await?;
    let status = response.status();
    let answer: serde_json::Value = response.json().await?;

    println!("   HTTP {}", status);
    println!("{}", serde_json::to_string_pretty(&answer)?);
    println!();

    match answer
        .pointer("/Result/ResultCode")
        .and_then(|code| code.as_str())
    {
        Some("Success") => {
            println!("✅ Join accepted");
            if let Some(accept) = answer.pointer("/PHYPayload").and_then(|p| p.as_str()) {
                println!("   Join-Accept PHY: {}", accept);
            }
        }
        Some(code) => println!("❌ Join rejected: {}", code),
        None => println!("⚠️  Answer carries no Result"),
    }

    Ok(())
}
