//! Deterministic fallback heuristic engine (§4.F), used when endpoint
//! negotiation is disabled, or fails and `allowEngineFallback` is set.

use crate::engine::optimizer::{self, BargainingProfile};

#[derive(Clone, Copy, Debug)]
pub struct Side {
    pub reservation: f64,
    pub initial_price: Option<f64>,
    pub step: f64,
    pub profile: BargainingProfile,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Agreed,
    NoAgreement,
}

#[derive(Clone, Debug)]
pub struct FallbackTurn {
    pub turn: i64,
    pub buyer_offer: f64,
    pub seller_ask: f64,
    pub outcome: Option<Outcome>,
    pub agreed_price: Option<f64>,
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

fn effective_step(step: Option<f64>) -> f64 {
    match step {
        Some(s) if s > 0.0 => s,
        _ => 1.0,
    }
}

fn initial_offer(reservation: f64, initial_price: Option<f64>, step: f64, is_buyer: bool) -> f64 {
    match initial_price {
        Some(p) if is_buyer => reservation.min(p),
        Some(p) => reservation.max(p),
        None if is_buyer => reservation - step * 2.0,
        None => reservation + step * 2.0,
    }
}

/// Run the deterministic alternating-concession heuristic for up to
/// `max_turns` rounds, modulated by each side's bargaining-power profile.
pub fn run(buyer: Side, seller: Side, max_turns: i64) -> Vec<FallbackTurn> {
    let max_turns = max_turns.clamp(1, 50);
    let buyer_step = effective_step(Some(buyer.step));
    let seller_step = effective_step(Some(seller.step));

    let mut buyer_offer = initial_offer(buyer.reservation, buyer.initial_price, buyer_step, true);
    let mut seller_ask = initial_offer(seller.reservation, seller.initial_price, seller_step, false);

    let mut turns = Vec::new();
    for turn in 1..=max_turns {
        if buyer_offer >= seller_ask {
            let price = optimizer::agreed_price(
                buyer_offer,
                seller_ask,
                buyer.reservation,
                seller.reservation,
                buyer.profile,
                seller.profile,
            );
            turns.push(FallbackTurn {
                turn,
                buyer_offer: round4(buyer_offer),
                seller_ask: round4(seller_ask),
                outcome: Some(Outcome::Agreed),
                agreed_price: price,
            });
            return turns;
        }

        if turn == max_turns {
            turns.push(FallbackTurn {
                turn,
                buyer_offer: round4(buyer_offer),
                seller_ask: round4(seller_ask),
                outcome: Some(Outcome::NoAgreement),
                agreed_price: None,
            });
            return turns;
        }

        turns.push(FallbackTurn {
            turn,
            buyer_offer: round4(buyer_offer),
            seller_ask: round4(seller_ask),
            outcome: None,
            agreed_price: None,
        });

        let buyer_weight = buyer.profile.weight();
        let seller_weight = seller.profile.weight();
        let next_buyer = buyer_offer + buyer_step * buyer_weight;
        let next_seller = seller_ask - seller_step * seller_weight;
        buyer_offer = next_buyer.min(buyer.reservation);
        seller_ask = next_seller.max(seller.reservation);
    }

    turns
}

#[cfg(test)]
mod test {
    use super::*;

    fn side(reservation: f64, initial: Option<f64>, step: f64) -> Side {
        Side {
            reservation,
            initial_price: initial,
            step,
            profile: BargainingProfile { leverage: 0.5, urgency: 0.5 },
        }
    }

    #[test]
    fn converges_to_agreement_within_max_turns() {
        let buyer = side(150.0, None, 5.0);
        let seller = side(50.0, None, 5.0);
        let turns = run(buyer, seller, 20);
        let last = turns.last().unwrap();
        assert_eq!(last.outcome, Some(Outcome::Agreed));
        assert!(last.agreed_price.is_some());
    }

    #[test]
    fn reports_no_agreement_when_turns_exhausted() {
        let buyer = side(60.0, Some(55.0), 0.001);
        let seller = side(59.0, Some(59.9), 0.001);
        let turns = run(buyer, seller, 3);
        assert_eq!(turns.len(), 3);
        assert_eq!(turns.last().unwrap().outcome, Some(Outcome::NoAgreement));
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let buyer = side(150.0, None, 5.0);
        let seller = side(50.0, None, 5.0);
        let a = run(buyer, seller, 20);
        let b = run(buyer, seller, 20);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.buyer_offer, y.buyer_offer);
            assert_eq!(x.seller_ask, y.seller_ask);
        }
    }
}
