use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use seatbook::clock::ManualClock;
use seatbook::rules::TimeRules;
use seatbook::venue::VenueManager;
use seatbook::wire;

const EMAIL: &str = "guest@example.com";

// ── Test infrastructure ──────────────────────────────────────

/// Server whose clock reads 2030-03-15 08:00 until a test moves it.
async fn start_test_server() -> (SocketAddr, Arc<ManualClock>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("seatbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let now = NaiveDate::from_ymd_opt(2030, 3, 15)
        .unwrap()
        .and_hms_opt(8, 0, 0)
        .unwrap();
    let clock = Arc::new(ManualClock::new(now));
    let vm = Arc::new(VenueManager::new(dir, 1000, clock.clone(), TimeRules::default()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let vm = vm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, vm, "seatbook".to_string(), None).await;
            });
        }
    });

    (addr, clock)
}

async fn connect(addr: SocketAddr, venue: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(venue)
        .user("seatbook")
        .password("seatbook");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn data_rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn select(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    data_rows(client.simple_query(sql).await.unwrap())
}

async fn sqlstate(client: &tokio_postgres::Client, sql: &str) -> String {
    let err = client.batch_execute(sql).await.unwrap_err();
    err.code()
        .map(|c| c.code().to_string())
        .unwrap_or_else(|| panic!("no SQLSTATE on {err}"))
}

struct Floor {
    space: Ulid,
    chairs: [Ulid; 2],
}

async fn seed(client: &tokio_postgres::Client) -> Floor {
    let space = Ulid::new();
    let chairs = [Ulid::new(), Ulid::new()];
    client
        .batch_execute(&format!(
            "INSERT INTO spaces (id, name) VALUES ('{space}', 'Reading room')"
        ))
        .await
        .unwrap();
    for (i, chair) in chairs.iter().enumerate() {
        client
            .batch_execute(&format!(
                "INSERT INTO chairs (id, space_id, name) VALUES ('{chair}', '{space}', 'seat {i}')"
            ))
            .await
            .unwrap();
    }
    client
        .batch_execute(&format!(
            "INSERT INTO users (id, email) VALUES ('{}', '{EMAIL}')",
            Ulid::new()
        ))
        .await
        .unwrap();
    Floor { space, chairs }
}

fn reserve_sql(id: Ulid, resource: Ulid, start: &str, end: &str) -> String {
    format!(
        r#"INSERT INTO reservations (id, user_email, resource_id, start, "end") VALUES ('{id}', '{EMAIL}', '{resource}', '{start}', '{end}')"#
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn connect_and_list_resources() {
    let (addr, _clock) = start_test_server().await;
    let client = connect(addr, "lobby").await;
    let floor = seed(&client).await;

    let rows = select(&client, "SELECT * FROM resources").await;
    assert_eq!(rows.len(), 3);

    let chair = rows
        .iter()
        .find(|r| r.get("id") == Some(floor.chairs[0].to_string().as_str()))
        .unwrap();
    assert_eq!(chair.get("resource_type"), Some("CHAIR"));
    assert_eq!(chair.get("space_id"), Some(floor.space.to_string().as_str()));
    assert_eq!(chair.get("name"), Some("seat 0"));
}

#[tokio::test]
async fn reserve_approve_and_fetch() {
    let (addr, _clock) = start_test_server().await;
    let client = connect(addr, "lobby").await;
    let floor = seed(&client).await;

    let id = Ulid::new();
    client
        .batch_execute(&reserve_sql(id, floor.chairs[0], "2030-03-16 10:00", "2030-03-16 11:30"))
        .await
        .unwrap();
    client
        .batch_execute(&format!("INSERT INTO approvals (id) VALUES ('{id}')"))
        .await
        .unwrap();

    let rows = select(&client, &format!("SELECT * FROM reservations WHERE id = '{id}'")).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status"), Some("APPROVED"));
    assert_eq!(rows[0].get("resource_type"), Some("CHAIR"));
    assert_eq!(rows[0].get("start"), Some("2030-03-16 10:00:00"));
    assert_eq!(rows[0].get("end"), Some("2030-03-16 11:30:00"));
}

#[tokio::test]
async fn domain_errors_carry_sqlstate() {
    let (addr, _clock) = start_test_server().await;
    let client = connect(addr, "lobby").await;
    let floor = seed(&client).await;

    client
        .batch_execute(&reserve_sql(Ulid::new(), floor.space, "2030-03-16 10:00", "2030-03-16 12:00"))
        .await
        .unwrap();

    // Space already held; chairs inside it are blocked too.
    let taken = reserve_sql(Ulid::new(), floor.chairs[1], "2030-03-16 11:00", "2030-03-16 11:30");
    assert_eq!(sqlstate(&client, &taken).await, "23P01");

    let misaligned = reserve_sql(Ulid::new(), floor.chairs[1], "2030-03-17 10:15", "2030-03-17 11:00");
    assert_eq!(sqlstate(&client, &misaligned).await, "22007");

    let too_soon = reserve_sql(Ulid::new(), floor.chairs[1], "2030-03-15 10:00", "2030-03-15 11:00");
    assert_eq!(sqlstate(&client, &too_soon).await, "22008");

    let missing = format!("INSERT INTO approvals VALUES ('{}')", Ulid::new());
    assert_eq!(sqlstate(&client, &missing).await, "P0002");

    assert_eq!(sqlstate(&client, "SELECT * FROM nowhere").await, "42601");
    assert_eq!(sqlstate(&client, "DROP TABLE spaces").await, "42601");
}

#[tokio::test]
async fn cancel_frees_the_slot() {
    let (addr, _clock) = start_test_server().await;
    let client = connect(addr, "lobby").await;
    let floor = seed(&client).await;

    let id = Ulid::new();
    let chair = floor.chairs[0];
    client
        .batch_execute(&reserve_sql(id, chair, "2030-03-16 09:00", "2030-03-16 10:00"))
        .await
        .unwrap();
    client
        .batch_execute(&format!("DELETE FROM reservations WHERE id = '{id}'"))
        .await
        .unwrap();

    let rows = select(&client, &format!("SELECT * FROM reservations WHERE id = '{id}'")).await;
    assert_eq!(rows[0].get("status"), Some("CANCELED"));

    client
        .batch_execute(&reserve_sql(Ulid::new(), chair, "2030-03-16 09:00", "2030-03-16 10:00"))
        .await
        .unwrap();

    // A second cancel is a status error, not a silent success.
    let again = format!("DELETE FROM reservations WHERE id = '{id}'");
    assert_eq!(sqlstate(&client, &again).await, "55000");
}

#[tokio::test]
async fn listing_pages_and_expires_pending() {
    let (addr, clock) = start_test_server().await;
    let client = connect(addr, "lobby").await;
    let floor = seed(&client).await;

    for h in [9, 11, 13] {
        client
            .batch_execute(&reserve_sql(
                Ulid::new(),
                floor.chairs[0],
                &format!("2030-03-16 {h:02}:00"),
                &format!("2030-03-16 {h:02}:30"),
            ))
            .await
            .unwrap();
    }

    let page = |after: Option<&str>| {
        let cursor = after.map_or(String::new(), |a| format!(" AND after = '{a}'"));
        format!(
            "SELECT * FROM reservations WHERE user_email = '{EMAIL}' AND status = 'PENDING' AND page_size = 2{cursor}"
        )
    };

    let first = select(&client, &page(None)).await;
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].get("start"), Some("2030-03-16 13:00:00"));
    assert_eq!(first[1].get("has_next"), Some("t"));

    let last_id = first[1].get("id").unwrap().to_string();
    let second = select(&client, &page(Some(&last_id))).await;
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].get("start"), Some("2030-03-16 09:00:00"));
    assert_eq!(second[0].get("has_next"), Some("f"));

    // Past the 11:30 end, listing sweeps the two earlier ones into REJECTED.
    clock.set(
        NaiveDate::from_ymd_opt(2030, 3, 16)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap(),
    );
    let pending = select(&client, &page(None)).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].get("start"), Some("2030-03-16 13:00:00"));

    let rejected = select(
        &client,
        &format!("SELECT * FROM reservations WHERE user_email = '{EMAIL}' AND status = 'REJECTED'"),
    )
    .await;
    assert_eq!(rejected.len(), 2);
}

#[tokio::test]
async fn space_conflicts_include_chairs() {
    let (addr, _clock) = start_test_server().await;
    let client = connect(addr, "lobby").await;
    let floor = seed(&client).await;

    client
        .batch_execute(&reserve_sql(Ulid::new(), floor.chairs[1], "2030-03-16 15:00", "2030-03-16 16:00"))
        .await
        .unwrap();
    client
        .batch_execute(&reserve_sql(Ulid::new(), floor.chairs[0], "2030-03-16 10:00", "2030-03-16 11:00"))
        .await
        .unwrap();

    let rows = select(
        &client,
        &format!(
            "SELECT * FROM conflicts WHERE space_id = '{}' AND at = '2030-03-16 08:00'",
            floor.space
        ),
    )
    .await;
    let starts: Vec<_> = rows.iter().map(|r| r.get("start").unwrap().to_string()).collect();
    assert_eq!(starts, ["2030-03-16 10:00:00", "2030-03-16 15:00:00"]);

    let chair_rows = select(
        &client,
        &format!(
            "SELECT * FROM conflicts WHERE chair_id = '{}' AND at = '2030-03-16 08:00'",
            floor.chairs[0]
        ),
    )
    .await;
    assert_eq!(chair_rows.len(), 1);
}

#[tokio::test]
async fn check_in_and_out() {
    let (addr, clock) = start_test_server().await;
    let client = connect(addr, "lobby").await;
    let floor = seed(&client).await;

    let rid = Ulid::new();
    client
        .batch_execute(&reserve_sql(rid, floor.chairs[0], "2030-03-15 12:00", "2030-03-15 14:00"))
        .await
        .unwrap();
    client
        .batch_execute(&format!("INSERT INTO approvals VALUES ('{rid}')"))
        .await
        .unwrap();

    clock.advance(Duration::hours(4) + Duration::minutes(10));
    let occ = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO check_ins (id, reservation_id) VALUES ('{occ}', '{rid}')"))
        .await
        .unwrap();
    let again = format!(
        "INSERT INTO check_ins (id, reservation_id) VALUES ('{}', '{rid}')",
        Ulid::new()
    );
    assert_eq!(sqlstate(&client, &again).await, "23505");

    clock.advance(Duration::minutes(50));
    client
        .batch_execute(&format!("INSERT INTO check_outs VALUES ('{occ}')"))
        .await
        .unwrap();

    let rows = select(&client, &format!("SELECT * FROM occupancies WHERE id = '{occ}'")).await;
    assert_eq!(rows[0].get("source"), Some("RESERVATION"));
    assert_eq!(rows[0].get("status"), Some("CHECK_OUT"));
    assert_eq!(rows[0].get("start"), Some("2030-03-15 12:10:00"));
    assert_eq!(rows[0].get("end"), Some("2030-03-15 13:00:00"));

    let twice = format!("INSERT INTO check_outs VALUES ('{occ}')");
    assert_eq!(sqlstate(&client, &twice).await, "55000");
}

#[tokio::test]
async fn walk_in_then_force_check_out() {
    let (addr, clock) = start_test_server().await;
    let client = connect(addr, "lobby").await;
    let floor = seed(&client).await;

    let occ = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO walk_ins VALUES ('{occ}', '{EMAIL}', '{}', '2030-03-15 18:00')",
            floor.space
        ))
        .await
        .unwrap();

    clock.advance(Duration::hours(1));
    client
        .batch_execute(&format!("DELETE FROM occupancies WHERE id = '{occ}'"))
        .await
        .unwrap();

    let rows = select(&client, &format!("SELECT * FROM occupancies WHERE id = '{occ}'")).await;
    assert_eq!(rows[0].get("source"), Some("WALK_IN"));
    assert_eq!(rows[0].get("status"), Some("FORCE_CHECK_OUT"));
    assert_eq!(rows[0].get("end"), Some("2030-03-15 09:00:00"));
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, _clock) = start_test_server().await;
    let client = connect(addr, "lobby").await;
    let floor = seed(&client).await;

    let id = Ulid::new().to_string();
    let chair = floor.chairs[1].to_string();
    let inserted = client
        .execute(
            r#"INSERT INTO reservations (id, user_email, resource_id, start, "end") VALUES ($1, $2, $3, $4, $5)"#,
            &[&id, &EMAIL, &chair, &"2030-03-16 10:00", &"2030-03-16 10:30"],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let rows = client
        .query("SELECT * FROM reservations WHERE id = $1", &[&id])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let status: &str = rows[0].get("status");
    assert_eq!(status, "PENDING");
}

#[tokio::test]
async fn venues_are_isolated() {
    let (addr, _clock) = start_test_server().await;
    let north = connect(addr, "north").await;
    let south = connect(addr, "south").await;

    seed(&north).await;
    assert_eq!(select(&north, "SELECT * FROM resources").await.len(), 3);
    assert!(select(&south, "SELECT * FROM resources").await.is_empty());

    let listing = format!(
        "SELECT * FROM reservations WHERE user_email = '{EMAIL}' AND status = 'PENDING'"
    );
    assert_eq!(sqlstate(&south, &listing).await, "P0002");
}
