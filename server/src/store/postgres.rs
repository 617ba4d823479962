//! PostgreSQL store built on sqlx. Multi-record operations run inside a
//! transaction; seat counts are guarded in the `UPDATE` itself so concurrent
//! bookings serialise on the match row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::{
    check_transition, seat_count, ticket_ids_of, NewUser, SeatReservation, SettleResult,
    Settlement, Store, StoreError,
};
use crate::models::{
    Match, MatchUpdate, NewMatch, Payment, PaymentOutcome, PaymentRequest, PaymentStatus, Role,
    Ticket, TicketStatus, User,
};

const LIVE_STATUSES: [&str; 3] = ["pending_payment", "active", "used"];
const STALE_BATCH: i64 = 100;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!().run(&self.pool).await
    }
}

#[derive(FromRow)]
struct TicketRow {
    id: Uuid,
    match_id: Uuid,
    user_id: Option<String>,
    seat_number: String,
    seat_type: String,
    price: Decimal,
    status: String,
    guest_secret: String,
    mpesa_checkout_request_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TicketRow> for Ticket {
    type Error = StoreError;

    fn try_from(row: TicketRow) -> Result<Self, Self::Error> {
        Ok(Ticket {
            id: row.id,
            match_id: row.match_id,
            user_id: row.user_id,
            seat_number: row.seat_number,
            seat_type: row.seat_type.parse()?,
            price: row.price,
            status: row.status.parse()?,
            guest_secret: row.guest_secret,
            mpesa_checkout_request_id: row.mpesa_checkout_request_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct PaymentRequestRow {
    checkout_request_id: String,
    merchant_request_id: String,
    match_id: Uuid,
    user_id: Option<String>,
    account_reference: String,
    phone: String,
    amount: Decimal,
    status: String,
    result_code: Option<i64>,
    result_desc: Option<String>,
    mpesa_receipt: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRequestRow> for PaymentRequest {
    type Error = StoreError;

    fn try_from(row: PaymentRequestRow) -> Result<Self, Self::Error> {
        Ok(PaymentRequest {
            checkout_request_id: row.checkout_request_id,
            merchant_request_id: row.merchant_request_id,
            match_id: row.match_id,
            user_id: row.user_id,
            account_reference: row.account_reference,
            phone: row.phone,
            amount: row.amount,
            status: row.status.parse()?,
            result_code: row.result_code,
            result_desc: row.result_desc,
            mpesa_receipt: row.mpesa_receipt,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct PaymentRow {
    id: Uuid,
    checkout_request_id: String,
    match_id: Uuid,
    user_id: Option<String>,
    mpesa_receipt: Option<String>,
    amount: Decimal,
    phone: String,
    ticket_count: i32,
    paid_at: DateTime<Utc>,
}

impl From<PaymentRow> for Payment {
    fn from(row: PaymentRow) -> Self {
        Payment {
            id: row.id,
            checkout_request_id: row.checkout_request_id,
            match_id: row.match_id,
            user_id: row.user_id,
            mpesa_receipt: row.mpesa_receipt,
            amount: row.amount,
            phone: row.phone,
            ticket_count: row.ticket_count,
            paid_at: row.paid_at,
        }
    }
}

#[derive(FromRow)]
struct UserRow {
    id: String,
    role: String,
    display_name: Option<String>,
    phone: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(User {
            id: row.id,
            role: row.role.parse()?,
            display_name: row.display_name,
            phone: row.phone,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn tickets_from(rows: Vec<TicketRow>) -> Result<Vec<Ticket>, StoreError> {
    rows.into_iter().map(Ticket::try_from).collect()
}

/// Moves the listed tickets still in `from` to `to` and returns them.
async fn move_tickets(
    tx: &mut Transaction<'_, Postgres>,
    ids: &[Uuid],
    from: TicketStatus,
    to: TicketStatus,
) -> Result<Vec<Ticket>, StoreError> {
    let rows: Vec<TicketRow> = sqlx::query_as(
        "UPDATE tickets SET status = $3, updated_at = now() \
         WHERE id = ANY($1) AND status = $2 \
         RETURNING *",
    )
    .bind(ids)
    .bind(from.as_str())
    .bind(to.as_str())
    .fetch_all(&mut **tx)
    .await?;
    let mut tickets = tickets_from(rows)?;
    tickets.sort_by(|a, b| a.seat_number.cmp(&b.seat_number));
    Ok(tickets)
}

async fn release_seats(
    tx: &mut Transaction<'_, Postgres>,
    match_id: Uuid,
    count: i32,
) -> Result<Match, StoreError> {
    sqlx::query_as::<_, Match>(
        "UPDATE matches \
         SET available_seats = LEAST(total_seats, available_seats + $2), updated_at = now() \
         WHERE id = $1 \
         RETURNING *",
    )
    .bind(match_id)
    .bind(count)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(StoreError::MatchNotFound(match_id))
}

#[async_trait]
impl Store for PgStore {
    async fn list_matches(&self) -> Result<Vec<Match>, StoreError> {
        let matches = sqlx::query_as::<_, Match>("SELECT * FROM matches ORDER BY match_date")
            .fetch_all(&self.pool)
            .await?;
        Ok(matches)
    }

    async fn get_match(&self, id: Uuid) -> Result<Match, StoreError> {
        sqlx::query_as::<_, Match>("SELECT * FROM matches WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::MatchNotFound(id))
    }

    async fn create_match(&self, new: NewMatch) -> Result<Match, StoreError> {
        let created = sqlx::query_as::<_, Match>(
            "INSERT INTO matches \
             (id, home_team, away_team, venue, match_date, ticket_price, vip_ticket_price, \
              total_seats, available_seats) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8) \
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&new.home_team)
        .bind(&new.away_team)
        .bind(&new.venue)
        .bind(new.match_date)
        .bind(new.ticket_price)
        .bind(new.vip_ticket_price)
        .bind(new.total_seats)
        .fetch_one(&self.pool)
        .await?;
        Ok(created)
    }

    async fn update_match(&self, id: Uuid, update: &MatchUpdate) -> Result<Match, StoreError> {
        let mut tx = self.pool.begin().await?;
        let current = sqlx::query_as::<_, Match>("SELECT * FROM matches WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::MatchNotFound(id))?;
        let next = update.apply_to(&current).map_err(StoreError::Conflict)?;

        let saved = sqlx::query_as::<_, Match>(
            "UPDATE matches SET home_team = $2, away_team = $3, venue = $4, match_date = $5, \
             ticket_price = $6, vip_ticket_price = $7, total_seats = $8, available_seats = $9, \
             updated_at = now() \
             WHERE id = $1 \
             RETURNING *",
        )
        .bind(id)
        .bind(&next.home_team)
        .bind(&next.away_team)
        .bind(&next.venue)
        .bind(next.match_date)
        .bind(next.ticket_price)
        .bind(next.vip_ticket_price)
        .bind(next.total_seats)
        .bind(next.available_seats)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(saved)
    }

    async fn delete_match(&self, id: Uuid) -> Result<(), StoreError> {
        let deleted =
            sqlx::query(
                "DELETE FROM matches WHERE id = $1 AND available_seats = total_seats \
                 AND NOT EXISTS (SELECT 1 FROM payments WHERE match_id = $1)",
            )
                .bind(id)
                .execute(&self.pool)
                .await?;
        if deleted.rows_affected() == 1 {
            return Ok(());
        }
        // Distinguish a missing match from one with held seats or payments.
        self.get_match(id).await?;
        Err(StoreError::SeatsSold(id))
    }

    async fn reserve_tickets(
        &self,
        reservation: SeatReservation,
    ) -> Result<Vec<Ticket>, StoreError> {
        let match_id = reservation.match_id;
        let wanted = seat_count(reservation.seats.len());
        let seat_numbers: Vec<String> = reservation
            .seats
            .iter()
            .map(|hold| hold.seat_number.clone())
            .collect();

        let mut tx = self.pool.begin().await?;

        let reserved = sqlx::query_as::<_, Match>(
            "UPDATE matches SET available_seats = available_seats - $2, updated_at = now() \
             WHERE id = $1 AND available_seats >= $2 \
             RETURNING *",
        )
        .bind(match_id)
        .bind(wanted)
        .fetch_optional(&mut *tx)
        .await?;
        if reserved.is_none() {
            let available: Option<i32> =
                sqlx::query_scalar("SELECT available_seats FROM matches WHERE id = $1")
                    .bind(match_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Err(match available {
                Some(available) => StoreError::InsufficientSeats { available },
                None => StoreError::MatchNotFound(match_id),
            });
        }

        // The row lock taken above serialises bookings for this match, so
        // this check sees every committed hold. The unique index backs it up.
        let taken: Option<String> = sqlx::query_scalar(
            "SELECT seat_number FROM tickets \
             WHERE match_id = $1 AND seat_number = ANY($2) AND status = ANY($3) \
             LIMIT 1",
        )
        .bind(match_id)
        .bind(&seat_numbers)
        .bind(&LIVE_STATUSES[..])
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(seat) = taken {
            return Err(StoreError::SeatTaken(seat));
        }

        let mut tickets = Vec::with_capacity(reservation.seats.len());
        for hold in reservation.seats {
            let row: TicketRow = sqlx::query_as(
                "INSERT INTO tickets \
                 (id, match_id, user_id, seat_number, seat_type, price, status, guest_secret) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 RETURNING *",
            )
            .bind(Uuid::new_v4())
            .bind(match_id)
            .bind(&reservation.user_id)
            .bind(&hold.seat_number)
            .bind(hold.seat_type.as_str())
            .bind(hold.price)
            .bind(TicketStatus::PendingPayment.as_str())
            .bind(&hold.guest_secret)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation()) {
                    StoreError::SeatTaken(hold.seat_number.clone())
                } else {
                    StoreError::Database(e)
                }
            })?;
            tickets.push(Ticket::try_from(row)?);
        }

        tx.commit().await?;
        debug!(%match_id, seats = wanted, "Seats reserved");
        Ok(tickets)
    }

    async fn open_payment_request(
        &self,
        request: &PaymentRequest,
        ticket_ids: &[Uuid],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO payment_requests \
             (checkout_request_id, merchant_request_id, match_id, user_id, account_reference, \
              phone, amount, status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)",
        )
        .bind(&request.checkout_request_id)
        .bind(&request.merchant_request_id)
        .bind(request.match_id)
        .bind(&request.user_id)
        .bind(&request.account_reference)
        .bind(&request.phone)
        .bind(request.amount)
        .bind(request.status.as_str())
        .bind(request.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE tickets SET mpesa_checkout_request_id = $1, updated_at = now() \
             WHERE id = ANY($2)",
        )
        .bind(&request.checkout_request_id)
        .bind(ticket_ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn abandon_reservation(
        &self,
        match_id: Uuid,
        ticket_ids: &[Uuid],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let failed = move_tickets(
            &mut tx,
            ticket_ids,
            TicketStatus::PendingPayment,
            TicketStatus::PaymentFailed,
        )
        .await?;
        release_seats(&mut tx, match_id, seat_count(failed.len())).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_payment_request(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<PaymentRequest>, StoreError> {
        let row: Option<PaymentRequestRow> =
            sqlx::query_as("SELECT * FROM payment_requests WHERE checkout_request_id = $1")
                .bind(checkout_request_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(PaymentRequest::try_from).transpose()
    }

    async fn stale_payment_requests(
        &self,
        opened_before: DateTime<Utc>,
    ) -> Result<Vec<PaymentRequest>, StoreError> {
        let rows: Vec<PaymentRequestRow> = sqlx::query_as(
            "SELECT * FROM payment_requests \
             WHERE status = $1 AND created_at < $2 \
             ORDER BY created_at \
             LIMIT $3",
        )
        .bind(PaymentStatus::Pending.as_str())
        .bind(opened_before)
        .bind(STALE_BATCH)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(PaymentRequest::try_from).collect()
    }

    async fn settle_payment(
        &self,
        checkout_request_id: &str,
        outcome: &PaymentOutcome,
    ) -> Result<SettleResult, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Only one caller can win the pending -> final update.
        let settled: Option<PaymentRequestRow> = sqlx::query_as(
            "UPDATE payment_requests \
             SET status = $2, result_code = $3, result_desc = $4, mpesa_receipt = $5, \
                 updated_at = now() \
             WHERE checkout_request_id = $1 AND status = $6 \
             RETURNING *",
        )
        .bind(checkout_request_id)
        .bind(outcome.status().as_str())
        .bind(outcome.result_code())
        .bind(outcome.description())
        .bind(outcome.receipt())
        .bind(PaymentStatus::Pending.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let request = match settled {
            Some(row) => PaymentRequest::try_from(row)?,
            None => {
                drop(tx);
                return Ok(match self.get_payment_request(checkout_request_id).await? {
                    Some(existing) => SettleResult::AlreadySettled(existing),
                    None => SettleResult::UnknownRequest,
                });
            }
        };
        let ticket_ids = ticket_ids_of(&request)?;

        let (tickets, football_match) = match outcome {
            PaymentOutcome::Paid {
                receipt,
                amount,
                phone,
                paid_at,
            } => {
                let tickets = move_tickets(
                    &mut tx,
                    &ticket_ids,
                    TicketStatus::PendingPayment,
                    TicketStatus::Active,
                )
                .await?;
                sqlx::query(
                    "INSERT INTO payments \
                     (id, checkout_request_id, match_id, user_id, mpesa_receipt, amount, phone, \
                      ticket_count, paid_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                )
                .bind(Uuid::new_v4())
                .bind(&request.checkout_request_id)
                .bind(request.match_id)
                .bind(&request.user_id)
                .bind(receipt)
                .bind(amount.unwrap_or(request.amount))
                .bind(phone.as_deref().unwrap_or(&request.phone))
                .bind(seat_count(tickets.len()))
                .bind(paid_at)
                .execute(&mut *tx)
                .await?;
                let football_match =
                    sqlx::query_as::<_, Match>("SELECT * FROM matches WHERE id = $1")
                        .bind(request.match_id)
                        .fetch_optional(&mut *tx)
                        .await?
                        .ok_or(StoreError::MatchNotFound(request.match_id))?;
                (tickets, football_match)
            }
            PaymentOutcome::Failed { .. } => {
                let tickets = move_tickets(
                    &mut tx,
                    &ticket_ids,
                    TicketStatus::PendingPayment,
                    TicketStatus::PaymentFailed,
                )
                .await?;
                let football_match =
                    release_seats(&mut tx, request.match_id, seat_count(tickets.len())).await?;
                (tickets, football_match)
            }
        };

        tx.commit().await?;
        Ok(SettleResult::Applied(Settlement {
            request,
            tickets,
            football_match,
        }))
    }

    async fn payments_for_match(&self, match_id: Uuid) -> Result<Vec<Payment>, StoreError> {
        let rows: Vec<PaymentRow> =
            sqlx::query_as("SELECT * FROM payments WHERE match_id = $1 ORDER BY paid_at")
                .bind(match_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(Payment::from).collect())
    }

    async fn get_ticket(&self, id: Uuid) -> Result<Ticket, StoreError> {
        let row: TicketRow = sqlx::query_as("SELECT * FROM tickets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::TicketNotFound(id))?;
        Ticket::try_from(row)
    }

    async fn tickets_for_user(&self, user_id: &str) -> Result<Vec<Ticket>, StoreError> {
        let rows: Vec<TicketRow> =
            sqlx::query_as("SELECT * FROM tickets WHERE user_id = $1 ORDER BY created_at DESC")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        tickets_from(rows)
    }

    async fn tickets_for_match(&self, match_id: Uuid) -> Result<Vec<Ticket>, StoreError> {
        let rows: Vec<TicketRow> = sqlx::query_as(
            "SELECT * FROM tickets WHERE match_id = $1 ORDER BY created_at, seat_number",
        )
        .bind(match_id)
        .fetch_all(&self.pool)
        .await?;
        tickets_from(rows)
    }

    async fn tickets_for_checkout(
        &self,
        checkout_request_id: &str,
    ) -> Result<Vec<Ticket>, StoreError> {
        let rows: Vec<TicketRow> = sqlx::query_as(
            "SELECT * FROM tickets WHERE mpesa_checkout_request_id = $1 \
             ORDER BY created_at, seat_number",
        )
        .bind(checkout_request_id)
        .fetch_all(&self.pool)
        .await?;
        tickets_from(rows)
    }

    async fn transition_ticket(
        &self,
        id: Uuid,
        from: TicketStatus,
        to: TicketStatus,
    ) -> Result<Ticket, StoreError> {
        check_transition(from, to)?;
        let mut tx = self.pool.begin().await?;
        let row: Option<TicketRow> = sqlx::query_as(
            "UPDATE tickets SET status = $3, updated_at = now() \
             WHERE id = $1 AND status = $2 \
             RETURNING *",
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let ticket = match row {
            Some(row) => Ticket::try_from(row)?,
            None => {
                drop(tx);
                let current = self.get_ticket(id).await?;
                return Err(StoreError::Conflict(format!(
                    "ticket is {}, expected {}",
                    current.status, from
                )));
            }
        };

        if from.holds_seat() && !to.holds_seat() {
            release_seats(&mut tx, ticket.match_id, 1).await?;
        }
        tx.commit().await?;
        Ok(ticket)
    }

    async fn ensure_user(&self, new: NewUser) -> Result<User, StoreError> {
        let row: UserRow = sqlx::query_as(
            "INSERT INTO users (id, role, display_name, phone) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO UPDATE SET \
                role = CASE WHEN EXCLUDED.role = $5 THEN EXCLUDED.role ELSE users.role END, \
                display_name = COALESCE(EXCLUDED.display_name, users.display_name), \
                phone = COALESCE(EXCLUDED.phone, users.phone), \
                updated_at = now() \
             RETURNING *",
        )
        .bind(&new.id)
        .bind(new.role.as_str())
        .bind(&new.display_name)
        .bind(&new.phone)
        .bind(Role::Admin.as_str())
        .fetch_one(&self.pool)
        .await?;
        User::try_from(row)
    }
}
