use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Days, NaiveDate, Utc};
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use carebook::engine::{Engine, EngineConfig};
use carebook::notify::NotifyHub;
use carebook::ratelimit::{CounterStore, RateLimiter, default_presets};
use carebook::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("carebook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(
        Engine::new(dir.join("carebook.wal"), Arc::new(NotifyHub::new()), EngineConfig::default()).unwrap(),
    );
    let counters: Arc<dyn CounterStore> = engine.clone();
    let limiter = Arc::new(RateLimiter::new(counters, default_presets()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, limiter, "carebook".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, user: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("carebook")
        .user(user)
        .password("carebook");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.as_db_error().map(|db| db.code().code())
}

/// A date safely inside the booking window, whatever the wall clock says.
fn booking_date() -> NaiveDate {
    Utc::now().date_naive().checked_add_days(Days::new(3)).unwrap()
}

fn ms(date: NaiveDate, hour: u32) -> i64 {
    date.and_hms_opt(hour, 0, 0).unwrap().and_utc().timestamp_millis()
}

struct Parties {
    caregiver_id: Ulid,
    admin: Client,
    caregiver: Client,
    owner: Client,
    owner_id: Ulid,
}

/// An approved dog walker with 09:00-12:00 on the booking date.
async fn setup(addr: SocketAddr) -> Parties {
    let caregiver_id = Ulid::new();
    let owner_id = Ulid::new();
    let admin = connect(addr, "admin").await;
    let caregiver = connect(addr, &format!("caregiver:{caregiver_id}")).await;
    let owner = connect(addr, &format!("owner:{owner_id}")).await;

    admin
        .batch_execute(&format!(
            r#"INSERT INTO caregivers (id, approved, services, region) VALUES ('{caregiver_id}', true, '["DOG_WALKING"]', 'Seoul')"#
        ))
        .await
        .unwrap();
    caregiver
        .batch_execute(&format!(
            "INSERT INTO availability (caregiver_id, service_id, date, slots) VALUES ('{caregiver_id}', 'DOG_WALKING', '{}', '09:00-12:00')",
            booking_date()
        ))
        .await
        .unwrap();

    Parties {
        caregiver_id,
        admin,
        caregiver,
        owner,
        owner_id,
    }
}

fn booking_insert(id: Ulid, owner_id: Ulid, caregiver_id: Ulid, start_hour: u32, end_hour: u32) -> String {
    let date = booking_date();
    format!(
        "INSERT INTO bookings (id, owner_id, caregiver_id, service_id, start_at, end_at, amount) VALUES ('{id}', '{owner_id}', '{caregiver_id}', 'DOG_WALKING', {}, {}, 15000)",
        ms(date, start_hour),
        ms(date, end_hour)
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_over_sql_updates_the_day_view() {
    let addr = start_test_server().await;
    let p = setup(addr).await;

    let booking_id = Ulid::new();
    p.owner
        .batch_execute(&booking_insert(booking_id, p.owner_id, p.caregiver_id, 10, 11))
        .await
        .unwrap();

    let day = rows(
        p.owner
            .simple_query(&format!(
                "SELECT * FROM day_slots WHERE caregiver_id = '{}' AND service_id = 'DOG_WALKING' AND date = '{}'",
                p.caregiver_id,
                booking_date()
            ))
            .await
            .unwrap(),
    );
    let kinds: Vec<(&str, &str, &str)> = day
        .iter()
        .map(|r| {
            (
                r.get("kind").unwrap(),
                r.get("start_minute").unwrap(),
                r.get("end_minute").unwrap(),
            )
        })
        .collect();
    assert_eq!(
        kinds,
        vec![("free", "540", "600"), ("free", "660", "720"), ("booked", "600", "660")]
    );

    let other_owner = Ulid::new();
    let rival = connect(addr, &format!("owner:{other_owner}")).await;
    let err = rival
        .batch_execute(&booking_insert(Ulid::new(), other_owner, p.caregiver_id, 9, 10))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23P01"));
}

#[tokio::test]
async fn lifecycle_and_cancellation_over_sql() {
    let addr = start_test_server().await;
    let p = setup(addr).await;
    let booking_id = Ulid::new();
    p.owner
        .batch_execute(&booking_insert(booking_id, p.owner_id, p.caregiver_id, 10, 11))
        .await
        .unwrap();

    let err = p
        .owner
        .batch_execute(&format!(
            "INSERT INTO booking_transitions (booking_id, status) VALUES ('{booking_id}', 'accepted')"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));

    p.caregiver
        .batch_execute(&format!(
            "INSERT INTO booking_transitions (booking_id, status) VALUES ('{booking_id}', 'accepted')"
        ))
        .await
        .unwrap();
    p.admin
        .batch_execute(&format!(
            "INSERT INTO booking_transitions (booking_id, status) VALUES ('{booking_id}', 'paid')"
        ))
        .await
        .unwrap();

    let quote = rows(
        p.owner
            .simple_query(&format!(
                "SELECT * FROM cancellation_quote WHERE booking_id = '{booking_id}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(quote.len(), 1);
    assert_eq!(quote[0].get("can_cancel"), Some("t"));

    p.owner
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{booking_id}'"))
        .await
        .unwrap();
    let listed = rows(
        p.owner
            .simple_query("SELECT * FROM bookings")
            .await
            .unwrap(),
    );
    let status = listed[0].get("status").unwrap();
    assert!(status == "refunded" || status == "cancelled", "unexpected status {status}");
}

#[tokio::test]
async fn matches_rank_the_caregiver() {
    let addr = start_test_server().await;
    let p = setup(addr).await;

    let ranked = rows(
        p.owner
            .simple_query(&format!(
                "SELECT * FROM matches WHERE service = 'DOG_WALKING' AND date = '{}' AND time_window = 'morning' AND region = 'Seoul'",
                booking_date()
            ))
            .await
            .unwrap(),
    );
    assert_eq!(ranked.len(), 1);
    assert_eq!(ranked[0].get("caregiver_id"), Some(p.caregiver_id.to_string().as_str()));
    assert_eq!(ranked[0].get("score"), Some("5"));
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let addr = start_test_server().await;
    let p = setup(addr).await;
    p.owner
        .batch_execute(&booking_insert(Ulid::new(), p.owner_id, p.caregiver_id, 10, 11))
        .await
        .unwrap();

    let found = p
        .caregiver
        .query(
            "SELECT * FROM bookings WHERE caregiver_id = $1",
            &[&p.caregiver_id.to_string()],
        )
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let status: String = found[0].get("status");
    assert_eq!(status, "pending");
    let amount: i64 = found[0].get("amount");
    assert_eq!(amount, 15_000);
}

#[tokio::test]
async fn unknown_users_are_refused() {
    let addr = start_test_server().await;
    let stranger = connect(addr, "postgres").await;
    let err = stranger
        .simple_query("SELECT * FROM bookings")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("28000"));
}

#[tokio::test]
async fn rate_limit_query_consumes_quota() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let mut allowed = Vec::new();
    for _ in 0..6 {
        let verdict = rows(
            admin
                .simple_query("SELECT * FROM rate_limit WHERE category = 'login' AND identifier = '203.0.113.7'")
                .await
                .unwrap(),
        );
        allowed.push(verdict[0].get("allowed").unwrap().to_string());
    }
    assert_eq!(allowed, vec!["t", "t", "t", "t", "t", "f"]);
}

#[tokio::test]
async fn malformed_sql_is_a_syntax_error() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let err = admin.simple_query("SELECT * FROM day_slots WHERE").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));
}

#[tokio::test]
async fn rate_limit_checks_are_scoped_to_the_caller() {
    let addr = start_test_server().await;
    let p = setup(addr).await;
    let rival_id = Ulid::new();
    let rival = connect(addr, &format!("owner:{rival_id}")).await;

    for _ in 0..25 {
        let err = rival
            .simple_query(&format!(
                "SELECT * FROM rate_limit WHERE category = 'booking' AND identifier = '{}'",
                p.owner_id
            ))
            .await
            .unwrap_err();
        assert_eq!(sqlstate(&err), Some("42501"));
    }

    // The targeted owner's quota is untouched.
    p.owner
        .batch_execute(&booking_insert(Ulid::new(), p.owner_id, p.caregiver_id, 10, 11))
        .await
        .unwrap();

    let own = rows(
        rival
            .simple_query(&format!(
                "SELECT * FROM rate_limit WHERE category = 'booking' AND identifier = '{rival_id}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(own[0].get("allowed"), Some("t"));
}

#[tokio::test]
async fn blocked_day_keeps_showing_its_bookings() {
    let addr = start_test_server().await;
    let p = setup(addr).await;
    p.owner
        .batch_execute(&booking_insert(Ulid::new(), p.owner_id, p.caregiver_id, 9, 10))
        .await
        .unwrap();
    p.caregiver
        .batch_execute(&format!(
            "INSERT INTO availability (caregiver_id, service_id, date, slots, blocked) VALUES ('{}', 'DOG_WALKING', '{}', '', true)",
            p.caregiver_id,
            booking_date()
        ))
        .await
        .unwrap();

    let day = rows(
        p.owner
            .simple_query(&format!(
                "SELECT * FROM day_slots WHERE caregiver_id = '{}' AND service_id = 'DOG_WALKING' AND date = '{}'",
                p.caregiver_id,
                booking_date()
            ))
            .await
            .unwrap(),
    );
    let kinds: Vec<&str> = day.iter().map(|r| r.get("kind").unwrap()).collect();
    assert_eq!(kinds, vec!["blocked", "booked"]);
    assert_eq!(day[1].get("start_minute"), Some("540"));
}

#[tokio::test]
async fn scoped_purge_is_refused() {
    let addr = start_test_server().await;
    let p = setup(addr).await;
    let err = p
        .admin
        .batch_execute(&format!(
            "DELETE FROM availability WHERE caregiver_id = '{}' AND date < '2100-01-01'",
            p.caregiver_id
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));

    let left = rows(
        p.owner
            .simple_query(&format!(
                "SELECT * FROM availability WHERE caregiver_id = '{}' AND service_id = 'DOG_WALKING' AND date = '{}'",
                p.caregiver_id,
                booking_date()
            ))
            .await
            .unwrap(),
    );
    assert_eq!(left.len(), 1);
}
