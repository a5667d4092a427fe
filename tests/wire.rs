use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use opdtoken::engine::Engine;
use opdtoken::model::Event;
use opdtoken::notify::NotifyHub;
use opdtoken::wire;

const H: i64 = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let engine = Arc::new(Engine::new(Arc::new(NotifyHub::new())));

    let served = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = served.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine).await;
            });
        }
    });

    (addr, engine)
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("opd")
        .user("frontdesk");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_default()
}

/// Register a doctor with one slot per capacity, hourly from 09:00.
async fn seed(client: &Client, caps: &[u32]) -> (Ulid, Vec<Ulid>) {
    let doctor = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO doctors (id, name) VALUES ('{doctor}', 'Dr. Kapoor')"
        ))
        .await
        .unwrap();
    let mut slots = Vec::new();
    for (i, cap) in caps.iter().enumerate() {
        let id = Ulid::new();
        let start = (9 + i as i64) * H;
        let end = start + H;
        client
            .batch_execute(&format!(
                r#"INSERT INTO slots (id, doctor_id, start, "end", max_capacity) VALUES ('{id}', '{doctor}', {start}, {end}, {cap})"#
            ))
            .await
            .unwrap();
        slots.push(id);
    }
    (doctor, slots)
}

async fn book(client: &Client, patient: &str, category: &str, slot: Ulid) -> SimpleQueryRow {
    let mut out = rows(
        client,
        &format!(
            "INSERT INTO tokens (patient_name, category, slot_id) VALUES ('{patient}', '{category}', '{slot}')"
        ),
    )
    .await;
    assert_eq!(out.len(), 1, "booking returns one receipt row");
    out.remove(0)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_returns_receipt() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (_, slots) = seed(&client, &[2]).await;

    let receipt = book(&client, "Asha", "online", slots[0]).await;
    assert_eq!(receipt.get("token_number"), Some("TKN-000001"));
    assert_eq!(receipt.get("category"), Some("ONLINE"));
    assert_eq!(receipt.get("rank"), Some("4"));
    assert_eq!(receipt.get("status"), Some("BOOKED"));
    assert_eq!(receipt.get("placement"), Some("direct"));
    assert_eq!(receipt.get("slot_id"), Some(slots[0].to_string().as_str()));
}

#[tokio::test]
async fn displacement_visible_in_receipt_and_schedule() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (doctor, slots) = seed(&client, &[1, 1]).await;

    let walk_in = book(&client, "Ravi", "WALK_IN", slots[0]).await;
    let walk_in_id = walk_in.get("id").unwrap().to_string();

    let receipt = book(&client, "Meera", "paid-priority", slots[0]).await;
    assert_eq!(receipt.get("placement"), Some("displaced"));
    assert_eq!(receipt.get("displaced_token_id"), Some(walk_in_id.as_str()));
    assert_eq!(receipt.get("relocated_to"), Some(slots[1].to_string().as_str()));

    let schedule = rows(
        &client,
        &format!("SELECT * FROM schedule WHERE doctor_id = '{doctor}'"),
    )
    .await;
    assert_eq!(schedule.len(), 2);
    assert_eq!(schedule[0].get("occupied"), Some("1"));
    assert_eq!(schedule[0].get("available"), Some("0"));

    let tokens: serde_json::Value =
        serde_json::from_str(schedule[1].get("tokens").unwrap()).unwrap();
    assert_eq!(tokens[0]["id"], walk_in_id.as_str());
    assert_eq!(tokens[0]["category"], "WALK_IN");
}

#[tokio::test]
async fn emergency_overflow_over_wire() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (doctor, slots) = seed(&client, &[1]).await;

    book(&client, "A", "follow_up", slots[0]).await;
    let receipt = rows(
        &client,
        &format!(
            "INSERT INTO emergency_tokens (patient_name, slot_id) VALUES ('Trauma', '{}')",
            slots[0]
        ),
    )
    .await;
    assert_eq!(receipt[0].get("placement"), Some("overflow"));
    assert_eq!(receipt[0].get("category"), Some("EMERGENCY"));

    let listed = rows(
        &client,
        &format!("SELECT * FROM slots WHERE doctor_id = '{doctor}'"),
    )
    .await;
    assert_eq!(listed[0].get("occupied"), Some("2"));
    assert_eq!(listed[0].get("status"), Some("OPEN"));
}

#[tokio::test]
async fn lifecycle_statements() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    let (_, slots) = seed(&client, &[3]).await;

    let a = book(&client, "A", "online", slots[0]).await.get("id").unwrap().to_string();
    let b = book(&client, "B", "online", slots[0]).await.get("id").unwrap().to_string();
    let c = book(&client, "C", "online", slots[0]).await.get("id").unwrap().to_string();

    client
        .batch_execute(&format!("DELETE FROM tokens WHERE id = '{a}'"))
        .await
        .unwrap();
    client
        .batch_execute(&format!("INSERT INTO no_shows (token_id) VALUES ('{b}')"))
        .await
        .unwrap();
    client
        .batch_execute(&format!("INSERT INTO completions (token_id) VALUES ('{c}')"))
        .await
        .unwrap();

    let token = rows(&client, &format!("SELECT * FROM tokens WHERE id = '{a}'")).await;
    assert_eq!(token[0].get("status"), Some("CANCELLED"));
    let token = rows(&client, &format!("SELECT * FROM tokens WHERE id = '{b}'")).await;
    assert_eq!(token[0].get("status"), Some("NO_SHOW"));
    let token = rows(&client, &format!("SELECT * FROM tokens WHERE id = '{c}'")).await;
    assert_eq!(token[0].get("status"), Some("COMPLETED"));

    assert_eq!(engine.occupancy(slots[0]).unwrap(), 0);

    // Cancelling twice is an engine error.
    assert_eq!(
        sqlstate(&client, &format!("DELETE FROM tokens WHERE id = '{a}'")).await,
        "P0001"
    );
}

#[tokio::test]
async fn stranded_tokens_listed_and_reassigned() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (doctor, slots) = seed(&client, &[1]).await;

    let walk_in = book(&client, "W", "walk_in", slots[0]).await.get("id").unwrap().to_string();
    let receipt = book(&client, "P", "paid_priority", slots[0]).await;
    assert_eq!(receipt.get("relocated_to"), Some(""));

    let stranded = rows(&client, "SELECT * FROM stranded_tokens").await;
    assert_eq!(stranded.len(), 1);
    assert_eq!(stranded[0].get("id"), Some(walk_in.as_str()));
    assert_eq!(stranded[0].get("status"), Some("REALLOCATED"));

    let evening = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO slots (id, doctor_id, start, "end", max_capacity) VALUES ('{evening}', '{doctor}', {}, {}, 2)"#,
            17 * H,
            18 * H
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO reassignments (token_id, slot_id) VALUES ('{walk_in}', '{evening}')"
        ))
        .await
        .unwrap();

    assert!(rows(&client, "SELECT * FROM stranded_tokens").await.is_empty());
}

#[tokio::test]
async fn closed_slot_rejects_bookings() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (doctor, slots) = seed(&client, &[2]).await;

    client
        .batch_execute(&format!("DELETE FROM slots WHERE id = '{}'", slots[0]))
        .await
        .unwrap();

    let listed = rows(
        &client,
        &format!("SELECT * FROM slots WHERE doctor_id = '{doctor}'"),
    )
    .await;
    assert_eq!(listed[0].get("status"), Some("CLOSED"));

    let sql = format!(
        "INSERT INTO tokens (patient_name, category, slot_id) VALUES ('A', 'online', '{}')",
        slots[0]
    );
    assert_eq!(sqlstate(&client, &sql).await, "P0001");
}

#[tokio::test]
async fn errors_map_to_sqlstate() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (_, slots) = seed(&client, &[1]).await;

    let bad_category = format!(
        "INSERT INTO tokens (patient_name, category, slot_id) VALUES ('A', 'vip', '{}')",
        slots[0]
    );
    assert_eq!(sqlstate(&client, &bad_category).await, "P0001");
    assert_eq!(sqlstate(&client, "SELECT * FROM nowhere").await, "42601");
    assert_eq!(sqlstate(&client, "DELETE FROM tokens").await, "42601");
}

#[tokio::test]
async fn doctors_listed() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (doctor, _) = seed(&client, &[1]).await;

    let listed = rows(&client, "SELECT * FROM doctors").await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("id"), Some(doctor.to_string().as_str()));
    assert_eq!(listed[0].get("name"), Some("Dr. Kapoor"));
}

#[tokio::test]
async fn extended_protocol_booking() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (_, slots) = seed(&client, &[2]).await;

    let slot = slots[0].to_string();
    let out = client
        .query(
            "INSERT INTO tokens (patient_name, category, slot_id) VALUES ($1, $2, $3)",
            &[&"Asha", &"follow_up", &slot.as_str()],
        )
        .await
        .unwrap();
    assert_eq!(out.len(), 1);
    let category: &str = out[0].get("category");
    assert_eq!(category, "FOLLOW_UP");
}

#[tokio::test]
async fn bound_name_containing_placeholder_text() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;

    let id = Ulid::new().to_string();
    client
        .execute(
            "INSERT INTO doctors (id, name) VALUES ($1, $2)",
            &[&id.as_str(), &"Room $1"],
        )
        .await
        .unwrap();

    let doctors = engine.list_doctors();
    assert_eq!(doctors.len(), 1);
    assert_eq!(doctors[0].id.to_string(), id);
    assert_eq!(doctors[0].name, "Room $1");
}

#[tokio::test]
async fn wire_mutations_reach_in_process_subscribers() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    let (doctor, slots) = seed(&client, &[1]).await;

    let mut rx = engine.subscribe(doctor);
    book(&client, "A", "online", slots[0]).await;

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("expected event")
        .unwrap();
    assert!(matches!(event, Event::TokenBooked { slot_id, .. } if slot_id == slots[0]));
}
