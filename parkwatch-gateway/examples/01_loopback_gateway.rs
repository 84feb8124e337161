//! Loopback Gateway Example
//!
//! Runs the whole gateway in-process on the in-memory bus and store, plays
//! the part of a parking-spot sensor, and exercises each service operation.
//!
//! ## What You'll Learn
//!
//! - Starting a [`Gateway`] on any bus/store pair
//! - How telemetry turns into stored points
//! - Waiting for a button press under a deadline
//! - Scripting query results and rating them
//!
//! ## Running the Example
//!
//! ```bash
//! RUST_LOG=debug cargo run -p parkwatch-gateway --example 01_loopback_gateway
//! ```

use std::sync::Arc;
use std::time::Duration;

use parkwatch_connectors::{MemoryBus, MemoryStore, MessageBus};
use parkwatch_core::time::SystemTime;
use parkwatch_core::{Aggregation, Row, Scalar};
use parkwatch_gateway::{Gateway, GatewayConfig};
use parkwatch_scoring::RatingProfile;
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("ParkWatch Loopback Gateway");
    println!("==========================\n");

    let mut config = GatewayConfig::default();
    config
        .ratings
        .insert("temperature".into(), RatingProfile::s_curve((20.0, 25.0), 0.5));

    let bus = Arc::new(MemoryBus::new());
    let store = Arc::new(MemoryStore::new());
    let gateway = Gateway::start(bus.clone(), store.clone(), Arc::new(SystemTime), &config).await?;
    let service = gateway.service();

    // 1. Sensor readings
    println!("1. Publishing sensor readings for spot-17");
    for payload in [
        json!({"appId": "TEMP", "data": 23.4}),
        json!({"appId": "HUMID", "data": "48.5"}),
        json!({"appId": "CO2", "data": 612}),
        json!({"appId": "MOTION", "data": "1"}),
    ] {
        bus.publish("things/spot-17/shadow/update", payload.to_string().into_bytes())
            .await?;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    for point in store.points() {
        println!("   {}", point.to_line_protocol());
    }

    // 2. Button press
    println!("\n2. Waiting for a button press (the sensor presses after 200ms)");
    let sensor = bus.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = sensor
            .publish(
                "things/spot-17/shadow/update",
                br#"{"appId":"BUTTON","data":"1"}"#.to_vec(),
            )
            .await;
    });
    let pressed_at = service
        .await_button_press("spot-17", Duration::from_secs(2))
        .await?;
    println!("   pressed at {} ms", pressed_at);

    match service.await_button_press("spot-17", Duration::from_millis(300)).await {
        Ok(_) => println!("   unexpected second press"),
        Err(e) => println!("   second wait: {} (HTTP {})", e, e.status_code()),
    }

    // 3. Statistics and rating
    println!("\n3. Mean temperature over the last hour");
    let mean = Row {
        device: None,
        measurement: String::new(),
        field: "temperature".into(),
        value: Scalar::Float(26.5),
        time: 0,
    };
    store.push_rows(vec![mean.clone()]);
    store.push_rows(vec![mean]);

    if let Some(row) = service
        .get_statistic("spot-17", "TEMP", Aggregation::Mean, "1h")
        .await?
    {
        println!("   mean = {:?}", row.value);
    }
    if let Some(rating) = service.rate_property("spot-17", "TEMP", "1h").await? {
        println!("   comfort rating = {:.2} / 5", rating);
    }
    println!("   query sent:\n{}", store.queries()[0]);

    // 4. Commands
    println!("\n4. Sending a command");
    service
        .publish_command("spot-17", "LED", json!({"color": "green"}))
        .await?;
    for message in bus.published_to("things/spot-17/commands") {
        println!("   {} <- {}", message.topic, String::from_utf8_lossy(&message.payload));
    }

    println!("\nRouter stats: {:?}", gateway.router_stats());
    gateway.stop().await;
    Ok(())
}
