//! In-process store. Backs tests and `STORAGE_BACKEND=memory` demos; state is
//! lost on restart. A single lock around all collections gives every
//! operation the same atomicity the Postgres transactions provide.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    check_transition, seat_count, ticket_ids_of, NewUser, SeatReservation, SettleResult,
    Settlement, Store, StoreError,
};
use crate::models::{
    Match, MatchUpdate, NewMatch, Payment, PaymentOutcome, PaymentRequest, PaymentStatus, Role,
    Ticket, TicketStatus, User,
};

#[derive(Default)]
struct Inner {
    matches: HashMap<Uuid, Match>,
    tickets: HashMap<Uuid, Ticket>,
    requests: HashMap<String, PaymentRequest>,
    payments: Vec<Payment>,
    users: HashMap<String, User>,
}

impl Inner {
    fn match_mut(&mut self, id: Uuid) -> Result<&mut Match, StoreError> {
        self.matches
            .get_mut(&id)
            .ok_or(StoreError::MatchNotFound(id))
    }

    fn release_seats(&mut self, match_id: Uuid, count: i32) -> Result<Match, StoreError> {
        let m = self.match_mut(match_id)?;
        if count > 0 {
            m.available_seats = (m.available_seats + count).min(m.total_seats);
            m.updated_at = Utc::now();
        }
        Ok(m.clone())
    }

    /// Moves every listed ticket still in `from` to `to`; returns the moved ones.
    fn move_tickets(&mut self, ids: &[Uuid], from: TicketStatus, to: TicketStatus) -> Vec<Ticket> {
        let now = Utc::now();
        let mut moved = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(ticket) = self.tickets.get_mut(id) {
                if ticket.status == from {
                    ticket.status = to;
                    ticket.updated_at = now;
                    moved.push(ticket.clone());
                }
            }
        }
        moved
    }

    fn seat_is_live(&self, match_id: Uuid, seat_number: &str) -> bool {
        self.tickets.values().any(|t| {
            t.match_id == match_id && t.seat_number == seat_number && t.status.holds_seat()
        })
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by_creation(mut tickets: Vec<Ticket>) -> Vec<Ticket> {
    tickets.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.seat_number.cmp(&b.seat_number))
    });
    tickets
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_matches(&self) -> Result<Vec<Match>, StoreError> {
        let inner = self.inner.lock().await;
        let mut matches: Vec<Match> = inner.matches.values().cloned().collect();
        matches.sort_by_key(|m| m.match_date);
        Ok(matches)
    }

    async fn get_match(&self, id: Uuid) -> Result<Match, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .matches
            .get(&id)
            .cloned()
            .ok_or(StoreError::MatchNotFound(id))
    }

    async fn create_match(&self, new: NewMatch) -> Result<Match, StoreError> {
        let now = Utc::now();
        let created = Match {
            id: Uuid::new_v4(),
            home_team: new.home_team,
            away_team: new.away_team,
            venue: new.venue,
            match_date: new.match_date,
            ticket_price: new.ticket_price,
            vip_ticket_price: new.vip_ticket_price,
            total_seats: new.total_seats,
            available_seats: new.total_seats,
            created_at: now,
            updated_at: now,
        };
        let mut inner = self.inner.lock().await;
        inner.matches.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update_match(&self, id: Uuid, update: &MatchUpdate) -> Result<Match, StoreError> {
        let mut inner = self.inner.lock().await;
        let current = inner.match_mut(id)?;
        let mut next = update.apply_to(current).map_err(StoreError::Conflict)?;
        next.updated_at = Utc::now();
        *current = next.clone();
        Ok(next)
    }

    async fn delete_match(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let current = inner.match_mut(id)?;
        let seats_held = current.sold_seats() > 0;
        // Collected money stays on record even after every ticket is cancelled.
        if seats_held || inner.payments.iter().any(|p| p.match_id == id) {
            return Err(StoreError::SeatsSold(id));
        }
        inner.matches.remove(&id);
        inner.tickets.retain(|_, t| t.match_id != id);
        inner.requests.retain(|_, r| r.match_id != id);
        Ok(())
    }

    async fn reserve_tickets(
        &self,
        reservation: SeatReservation,
    ) -> Result<Vec<Ticket>, StoreError> {
        let mut inner = self.inner.lock().await;
        let match_id = reservation.match_id;
        let wanted = seat_count(reservation.seats.len());

        if let Some(taken) = reservation
            .seats
            .iter()
            .find(|hold| inner.seat_is_live(match_id, &hold.seat_number))
        {
            return Err(StoreError::SeatTaken(taken.seat_number.clone()));
        }

        let m = inner.match_mut(match_id)?;
        if m.available_seats < wanted {
            return Err(StoreError::InsufficientSeats {
                available: m.available_seats,
            });
        }
        let now = Utc::now();
        m.available_seats -= wanted;
        m.updated_at = now;

        let tickets: Vec<Ticket> = reservation
            .seats
            .into_iter()
            .map(|hold| Ticket {
                id: Uuid::new_v4(),
                match_id,
                user_id: reservation.user_id.clone(),
                seat_number: hold.seat_number,
                seat_type: hold.seat_type,
                price: hold.price,
                status: TicketStatus::PendingPayment,
                guest_secret: hold.guest_secret,
                mpesa_checkout_request_id: None,
                created_at: now,
                updated_at: now,
            })
            .collect();
        for ticket in &tickets {
            inner.tickets.insert(ticket.id, ticket.clone());
        }
        Ok(tickets)
    }

    async fn open_payment_request(
        &self,
        request: &PaymentRequest,
        ticket_ids: &[Uuid],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.requests.contains_key(&request.checkout_request_id) {
            return Err(StoreError::Conflict(format!(
                "payment request {} already exists",
                request.checkout_request_id
            )));
        }
        inner
            .requests
            .insert(request.checkout_request_id.clone(), request.clone());
        for id in ticket_ids {
            if let Some(ticket) = inner.tickets.get_mut(id) {
                ticket.mpesa_checkout_request_id = Some(request.checkout_request_id.clone());
            }
        }
        Ok(())
    }

    async fn abandon_reservation(
        &self,
        match_id: Uuid,
        ticket_ids: &[Uuid],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let failed = inner.move_tickets(
            ticket_ids,
            TicketStatus::PendingPayment,
            TicketStatus::PaymentFailed,
        );
        inner.release_seats(match_id, seat_count(failed.len()))?;
        Ok(())
    }

    async fn get_payment_request(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<PaymentRequest>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.requests.get(checkout_request_id).cloned())
    }

    async fn stale_payment_requests(
        &self,
        opened_before: DateTime<Utc>,
    ) -> Result<Vec<PaymentRequest>, StoreError> {
        let inner = self.inner.lock().await;
        let mut stale: Vec<PaymentRequest> = inner
            .requests
            .values()
            .filter(|r| r.status == PaymentStatus::Pending && r.created_at < opened_before)
            .cloned()
            .collect();
        stale.sort_by_key(|r| r.created_at);
        Ok(stale)
    }

    async fn settle_payment(
        &self,
        checkout_request_id: &str,
        outcome: &PaymentOutcome,
    ) -> Result<SettleResult, StoreError> {
        let mut inner = self.inner.lock().await;
        let request = match inner.requests.get(checkout_request_id) {
            None => return Ok(SettleResult::UnknownRequest),
            Some(r) if r.status != PaymentStatus::Pending => {
                return Ok(SettleResult::AlreadySettled(r.clone()))
            }
            Some(r) => r.clone(),
        };
        let ticket_ids = ticket_ids_of(&request)?;
        let now = Utc::now();

        let (tickets, football_match) = match outcome {
            PaymentOutcome::Paid {
                receipt,
                amount,
                phone,
                paid_at,
            } => {
                let tickets = inner.move_tickets(
                    &ticket_ids,
                    TicketStatus::PendingPayment,
                    TicketStatus::Active,
                );
                inner.payments.push(Payment {
                    id: Uuid::new_v4(),
                    checkout_request_id: request.checkout_request_id.clone(),
                    match_id: request.match_id,
                    user_id: request.user_id.clone(),
                    mpesa_receipt: receipt.clone(),
                    amount: amount.unwrap_or(request.amount),
                    phone: phone.clone().unwrap_or_else(|| request.phone.clone()),
                    ticket_count: seat_count(tickets.len()),
                    paid_at: *paid_at,
                });
                let m = inner.match_mut(request.match_id)?.clone();
                (tickets, m)
            }
            PaymentOutcome::Failed { .. } => {
                let tickets = inner.move_tickets(
                    &ticket_ids,
                    TicketStatus::PendingPayment,
                    TicketStatus::PaymentFailed,
                );
                let m = inner.release_seats(request.match_id, seat_count(tickets.len()))?;
                (tickets, m)
            }
        };

        let settled = PaymentRequest {
            status: outcome.status(),
            result_code: outcome.result_code(),
            result_desc: Some(outcome.description()),
            mpesa_receipt: outcome.receipt().map(String::from),
            updated_at: now,
            ..request
        };
        inner
            .requests
            .insert(settled.checkout_request_id.clone(), settled.clone());

        Ok(SettleResult::Applied(Settlement {
            request: settled,
            tickets: sorted_by_creation(tickets),
            football_match,
        }))
    }

    async fn payments_for_match(&self, match_id: Uuid) -> Result<Vec<Payment>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .payments
            .iter()
            .filter(|p| p.match_id == match_id)
            .cloned()
            .collect())
    }

    async fn get_ticket(&self, id: Uuid) -> Result<Ticket, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .tickets
            .get(&id)
            .cloned()
            .ok_or(StoreError::TicketNotFound(id))
    }

    async fn tickets_for_user(&self, user_id: &str) -> Result<Vec<Ticket>, StoreError> {
        let inner = self.inner.lock().await;
        let mut tickets = sorted_by_creation(
            inner
                .tickets
                .values()
                .filter(|t| t.is_owned_by(user_id))
                .cloned()
                .collect(),
        );
        tickets.reverse();
        Ok(tickets)
    }

    async fn tickets_for_match(&self, match_id: Uuid) -> Result<Vec<Ticket>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(sorted_by_creation(
            inner
                .tickets
                .values()
                .filter(|t| t.match_id == match_id)
                .cloned()
                .collect(),
        ))
    }

    async fn tickets_for_checkout(
        &self,
        checkout_request_id: &str,
    ) -> Result<Vec<Ticket>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(sorted_by_creation(
            inner
                .tickets
                .values()
                .filter(|t| t.mpesa_checkout_request_id.as_deref() == Some(checkout_request_id))
                .cloned()
                .collect(),
        ))
    }

    async fn transition_ticket(
        &self,
        id: Uuid,
        from: TicketStatus,
        to: TicketStatus,
    ) -> Result<Ticket, StoreError> {
        check_transition(from, to)?;
        let mut inner = self.inner.lock().await;
        let ticket = inner
            .tickets
            .get_mut(&id)
            .ok_or(StoreError::TicketNotFound(id))?;
        if ticket.status != from {
            return Err(StoreError::Conflict(format!(
                "ticket is {}, expected {}",
                ticket.status, from
            )));
        }
        ticket.status = to;
        ticket.updated_at = Utc::now();
        let updated = ticket.clone();

        if from.holds_seat() && !to.holds_seat() {
            inner.release_seats(updated.match_id, 1)?;
        }
        Ok(updated)
    }

    async fn ensure_user(&self, new: NewUser) -> Result<User, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let user = inner.users.entry(new.id.clone()).or_insert_with(|| User {
            id: new.id.clone(),
            role: new.role,
            display_name: None,
            phone: None,
            created_at: now,
            updated_at: now,
        });
        if new.role == Role::Admin {
            user.role = Role::Admin;
        }
        if new.display_name.is_some() {
            user.display_name = new.display_name;
        }
        if new.phone.is_some() {
            user.phone = new.phone;
        }
        Ok(user.clone())
    }
}
