use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};

use yardbay::auth::YardAuthSource;
use yardbay::config::{Secret, ZoneConfig};
use yardbay::session::Yard;
use yardbay::store::{CsvCodec, MemoryRepository, RemoteRepository, ScheduleStore};
use yardbay::wire;

const OFFICE_SECRET: &str = "office-test-secret";
const VIEWER_PASSWORD: &str = "gate-test-code";

const SCHEDULE: &str = "\
Booking_No,Zone,Bay,Time,Status
B1,Zone 1,,08:00,Arrived
B2,Zone 1,,09:00,Expected
B3,Zone 2,Bay 2,08:30,Arrived
";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<MemoryRepository>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let repo = Arc::new(MemoryRepository::with_content(SCHEDULE.as_bytes().to_vec()));
    let store = Arc::new(ScheduleStore::new(
        repo.clone(),
        Arc::new(CsvCodec),
        Duration::from_secs(3),
    ));
    let yard = Arc::new(Yard::new(store, ZoneConfig::default()));
    let auth = YardAuthSource::new(
        "office".to_string(),
        Some(Secret::new(OFFICE_SECRET)),
        Secret::new(VIEWER_PASSWORD),
    );

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let yard = yard.clone();
            let auth = auth.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, yard, auth, "office".to_string(), None)
                    .await;
            });
        }
    });

    (addr, repo)
}

async fn try_connect(addr: SocketAddr, user: &str, password: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("yard")
        .user(user)
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn office(addr: SocketAddr) -> Client {
    try_connect(addr, "office", OFFICE_SECRET).await.unwrap()
}

async fn viewer(addr: SocketAddr) -> Client {
    try_connect(addr, "gate", VIEWER_PASSWORD).await.unwrap()
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<tokio_postgres::SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.code().map(|c| c.code())
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn viewer_reads_bookings_and_board() {
    let (addr, _repo) = start_test_server().await;
    let client = viewer(addr).await;

    let all = rows(client.simple_query("SELECT * FROM bookings").await.unwrap());
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].get("booking_no"), Some("B1"));

    let board = rows(
        client
            .simple_query("SELECT * FROM yard WHERE zone = 'Zone 2'")
            .await
            .unwrap(),
    );
    assert_eq!(board.len(), 5);
    let bay2 = board.iter().find(|r| r.get("bay") == Some("Bay 2")).unwrap();
    assert_eq!(bay2.get("state"), Some("occupied"));
    assert_eq!(bay2.get("booking_no"), Some("B3"));

    let zones = rows(client.simple_query("SELECT * FROM zones").await.unwrap());
    assert_eq!(zones.len(), 4);
    let zone1 = zones.iter().find(|r| r.get("zone") == Some("Zone 1")).unwrap();
    assert_eq!(zone1.get("unassigned"), Some("2"));
}

#[tokio::test]
async fn lookup_with_bound_parameter() {
    let (addr, _repo) = start_test_server().await;
    let client = viewer(addr).await;

    let found = client
        .query("SELECT * FROM bookings WHERE booking_no = $1", &[&"b3"])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let zone: String = found[0].get("zone");
    assert_eq!(zone, "Zone 2");

    let err = client
        .simple_query("SELECT * FROM bookings WHERE booking_no = 'NOPE'")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("02000"));
}

#[tokio::test]
async fn viewer_cannot_change_schedule() {
    let (addr, repo) = start_test_server().await;
    let client = viewer(addr).await;

    let err = client
        .simple_query("INSERT INTO bookings (booking_no, zone, time) VALUES ('B9', 'Zone 3', '10:00')")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));

    let err = client.simple_query("ASSIGN B1").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));

    let stored = repo.read().await.unwrap().unwrap();
    assert_eq!(stored.content, SCHEDULE.as_bytes());
}

#[tokio::test]
async fn assign_until_full_then_release() {
    let (addr, _repo) = start_test_server().await;
    let client = office(addr).await;

    let assigned = rows(client.simple_query("ASSIGN B1").await.unwrap());
    assert_eq!(assigned.len(), 1);
    assert_eq!(assigned[0].get("zone"), Some("Zone 1"));
    assert_eq!(assigned[0].get("bay"), Some("Bay 1"));

    let err = client.simple_query("ASSIGN B2").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("53400"));

    client
        .simple_query("DELETE FROM bookings WHERE booking_no = 'B1'")
        .await
        .unwrap();

    let assigned = rows(client.simple_query("ASSIGN B2").await.unwrap());
    assert_eq!(assigned[0].get("bay"), Some("Bay 1"));

    let b1 = rows(
        client
            .simple_query("SELECT * FROM bookings WHERE booking_no = 'B1'")
            .await
            .unwrap(),
    );
    assert_eq!(b1[0].get("status"), Some("Completed"));
}

#[tokio::test]
async fn prepared_assign_describes_its_columns() {
    let (addr, _repo) = start_test_server().await;
    let client = office(addr).await;

    let stmt = client.prepare("ASSIGN $1").await.unwrap();
    assert_eq!(stmt.columns().len(), 3);

    let assigned = client.query(&stmt, &[&"B1"]).await.unwrap();
    assert_eq!(assigned.len(), 1);
    let bay: String = assigned[0].get("bay");
    assert_eq!(bay, "Bay 1");
}

#[tokio::test]
async fn bound_values_cannot_reshape_the_statement() {
    let (addr, _repo) = start_test_server().await;
    let client = office(addr).await;

    client
        .execute(
            "INSERT INTO bookings (booking_no, zone, time) VALUES ($2, $1, $3)",
            &[&"Zone 3", &"BK$1", &"10:00"],
        )
        .await
        .unwrap();

    let found = client
        .query("SELECT * FROM bookings WHERE booking_no = $1", &[&"BK$1"])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let zone: String = found[0].get("zone");
    assert_eq!(zone, "Zone 3");
}

#[tokio::test]
async fn office_edits_are_visible_to_other_sessions() {
    let (addr, repo) = start_test_server().await;
    let office = office(addr).await;
    let gate = viewer(addr).await;

    // Warm the viewer's cache first; the commit must invalidate it.
    rows(gate.simple_query("SELECT * FROM bookings").await.unwrap());

    office
        .simple_query(
            "INSERT INTO bookings (booking_no, zone, time) VALUES ('B4', 'Zone 3', '10:15')",
        )
        .await
        .unwrap();

    let seen = rows(
        gate.simple_query("SELECT * FROM bookings WHERE booking_no = 'B4'")
            .await
            .unwrap(),
    );
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].get("status"), Some("Expected"));
    assert_eq!(seen[0].get("bay"), None);

    let stored = repo.read().await.unwrap().unwrap();
    assert!(String::from_utf8(stored.content).unwrap().contains("B4,Zone 3,,10:15,Expected"));
}

#[tokio::test]
async fn invalid_edit_is_rejected() {
    let (addr, _repo) = start_test_server().await;
    let client = office(addr).await;

    let err = client
        .simple_query("INSERT INTO bookings (booking_no, zone, time) VALUES ('B5', 'Zone 9', '10:00')")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("22023"));

    let err = client.simple_query("SELEKT everything").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));
}

#[tokio::test]
async fn wrong_office_secret_is_refused() {
    let (addr, _repo) = start_test_server().await;
    assert!(try_connect(addr, "office", VIEWER_PASSWORD).await.is_err());
    assert!(try_connect(addr, "gate", "wrong").await.is_err());
}
