//! Episode III: the card battle referee and the tournament index.
//!
//! The referee owns battle setup and turn sequencing only; resolving what
//! an individual card does is the card-engine collaborator's job and stays
//! outside this module. Tournaments are an orthogonal bracket structure
//! that persists across restarts.

pub mod tournament;

pub use tournament::{Tournament, TournamentIndex, TournamentTeam};

use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::HandlerError;
use ragol_proto::command::{ep3_op, PayloadReader};

/// Battle rules negotiated during registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rules {
    /// Whole-battle limit in minutes; 0 = none.
    pub overall_time_limit: u8,
    /// Per-phase limit in seconds; 0 = none.
    pub phase_time_limit: u8,
    pub min_dice: u8,
    pub max_dice: u8,
    /// One bit per allowed card rank.
    pub allowed_card_ranks: u8,
    /// 0 = defense HP, 1 = common HP.
    pub hp_type: u8,
}

impl Default for Rules {
    fn default() -> Self {
        Rules {
            overall_time_limit: 0,
            phase_time_limit: 0,
            min_dice: 1,
            max_dice: 6,
            allowed_card_ranks: 0xFF,
            hp_type: 0,
        }
    }
}

/// One seat's registered deck.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeckEntry {
    pub player_name: String,
    pub card_ids: Vec<u16>,
    pub ready: bool,
}

/// Referee phases. Each round walks the action sub-phases in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BattlePhase {
    Registration,
    Setup,
    Action(ActionSubPhase),
    Finished,
}

/// The per-turn sub-phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionSubPhase {
    Dice,
    SetCard,
    Move,
    Attack,
    Draw,
}

impl ActionSubPhase {
    fn next(self) -> Option<ActionSubPhase> {
        match self {
            ActionSubPhase::Dice => Some(ActionSubPhase::SetCard),
            ActionSubPhase::SetCard => Some(ActionSubPhase::Move),
            ActionSubPhase::Move => Some(ActionSubPhase::Attack),
            ActionSubPhase::Attack => Some(ActionSubPhase::Draw),
            ActionSubPhase::Draw => None,
        }
    }
}

/// A result command to broadcast to the battle's clients, re-framed by the
/// caller inside the 0xB6 sub-command envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BattleEvent {
    pub opcode: u8,
    pub payload: Bytes,
}

/// The referee for one Episode III game.
pub struct BattleState {
    pub map_number: Option<u32>,
    pub rules: Rules,
    pub decks: [Option<DeckEntry>; 4],
    pub phase: BattlePhase,
    pub round: u32,
    /// Which team acts in the current round (0 or 1).
    pub active_team: u8,
    /// Last dice roll per seat.
    pub dice: [[u8; 2]; 4],
    pub team_exp: [u32; 2],
    rng: StdRng,
}

impl std::fmt::Debug for BattleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BattleState")
            .field("phase", &self.phase)
            .field("round", &self.round)
            .field("map_number", &self.map_number)
            .finish_non_exhaustive()
    }
}

impl BattleState {
    /// Seeded from the game's random seed so replays sequence identically.
    pub fn new(seed: u32) -> BattleState {
        BattleState {
            map_number: None,
            rules: Rules::default(),
            decks: [None, None, None, None],
            phase: BattlePhase::Registration,
            round: 0,
            active_team: 0,
            dice: [[0; 2]; 4],
            team_exp: [0; 2],
            rng: StdRng::seed_from_u64(seed as u64),
        }
    }

    fn require_phase(&self, phase: BattlePhase) -> Result<(), HandlerError> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(HandlerError::Runtime(format!(
                "battle command out of phase (in {:?})",
                self.phase
            )))
        }
    }

    /// Apply one 0xB6 sub-sub-command. Returns the events to broadcast.
    pub fn handle_opcode(
        &mut self,
        opcode: u8,
        payload: &[u8],
    ) -> Result<Vec<BattleEvent>, HandlerError> {
        match opcode {
            ep3_op::MAP_DEFINITION => {
                self.require_phase(BattlePhase::Registration)?;
                let mut r = PayloadReader::new(payload);
                self.map_number = Some(r.get_u32()?);
                Ok(vec![self.echo(opcode, payload)])
            }
            ep3_op::SET_RULES => {
                self.require_phase(BattlePhase::Registration)?;
                let mut r = PayloadReader::new(payload);
                let rules = Rules {
                    overall_time_limit: r.get_u8()?,
                    phase_time_limit: r.get_u8()?,
                    min_dice: r.get_u8()?.max(1),
                    max_dice: r.get_u8()?,
                    allowed_card_ranks: r.get_u8()?,
                    hp_type: r.get_u8()?,
                };
                if rules.max_dice < rules.min_dice {
                    return Err(HandlerError::Runtime("dice range inverted".into()));
                }
                self.rules = rules;
                Ok(vec![self.echo(opcode, payload)])
            }
            ep3_op::REGISTER_DECK => {
                self.require_phase(BattlePhase::Registration)?;
                let mut r = PayloadReader::new(payload);
                let seat = r.get_u8()? as usize;
                if seat >= 4 {
                    return Err(HandlerError::Runtime("deck seat out of range".into()));
                }
                let name = r.get_ascii(0x10)?;
                let count = r.get_u8()? as usize;
                let mut card_ids = Vec::with_capacity(count);
                for _ in 0..count {
                    card_ids.push(r.get_u16()?);
                }
                self.decks[seat] = Some(DeckEntry {
                    player_name: name,
                    card_ids,
                    ready: false,
                });
                Ok(vec![self.echo(opcode, payload)])
            }
            ep3_op::READY => {
                self.require_phase(BattlePhase::Registration)?;
                let mut r = PayloadReader::new(payload);
                let seat = r.get_u8()? as usize;
                let deck = self
                    .decks
                    .get_mut(seat)
                    .and_then(Option::as_mut)
                    .ok_or_else(|| HandlerError::Runtime("ready without a deck".into()))?;
                deck.ready = true;

                let all_ready = self
                    .decks
                    .iter()
                    .flatten()
                    .all(|d| d.ready);
                let mut events = vec![self.echo(opcode, payload)];
                if all_ready && self.map_number.is_some() {
                    self.phase = BattlePhase::Setup;
                    let mut out = BytesMut::with_capacity(4);
                    out.put_u32_le(0);
                    events.push(BattleEvent {
                        opcode: ep3_op::ADVANCE_PHASE,
                        payload: out.freeze(),
                    });
                }
                Ok(events)
            }
            ep3_op::ROLL_DICE => {
                let BattlePhase::Action(ActionSubPhase::Dice) = self.phase else {
                    return Err(HandlerError::Runtime("dice roll out of phase".into()));
                };
                let mut r = PayloadReader::new(payload);
                let seat = r.get_u8()? as usize;
                if seat >= 4 {
                    return Err(HandlerError::Runtime("dice seat out of range".into()));
                }
                let (lo, hi) = (self.rules.min_dice, self.rules.max_dice);
                let roll = [
                    self.rng.gen_range(lo..=hi),
                    self.rng.gen_range(lo..=hi),
                ];
                self.dice[seat] = roll;
                let mut out = BytesMut::with_capacity(4);
                out.put_u8(seat as u8);
                out.put_u8(roll[0]);
                out.put_u8(roll[1]);
                out.put_u8(0);
                Ok(vec![BattleEvent {
                    opcode,
                    payload: out.freeze(),
                }])
            }
            ep3_op::ADVANCE_PHASE => {
                match self.phase {
                    BattlePhase::Setup => {
                        self.round = 1;
                        self.phase = BattlePhase::Action(ActionSubPhase::Dice);
                    }
                    BattlePhase::Action(sub) => match sub.next() {
                        Some(next) => {
                            self.phase = BattlePhase::Action(next);
                        }
                        None => {
                            // Round over: the other team acts, dice come first.
                            self.active_team ^= 1;
                            self.round += 1;
                            self.phase = BattlePhase::Action(ActionSubPhase::Dice);
                        }
                    },
                    _ => {
                        return Err(HandlerError::Runtime(
                            "phase advance outside battle".into(),
                        ));
                    }
                }
                let mut out = BytesMut::with_capacity(8);
                out.put_u32_le(self.round);
                out.put_u8(self.active_team);
                Ok(vec![BattleEvent {
                    opcode,
                    payload: out.freeze(),
                }])
            }
            ep3_op::BATTLE_RESULT => {
                let mut r = PayloadReader::new(payload);
                let winner = r.get_u8()?;
                let exp = r.get_u32()?;
                if winner < 2 {
                    self.team_exp[winner as usize] += exp;
                }
                self.phase = BattlePhase::Finished;
                Ok(vec![self.echo(opcode, payload)])
            }
            _ => Err(HandlerError::Runtime(format!(
                "unknown battle opcode {opcode:#04x}"
            ))),
        }
    }

    fn echo(&self, opcode: u8, payload: &[u8]) -> BattleEvent {
        BattleEvent {
            opcode,
            payload: Bytes::copy_from_slice(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deck_payload(seat: u8, name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(seat);
        let mut field = name.as_bytes().to_vec();
        field.resize(0x10, 0);
        out.extend_from_slice(&field);
        out.push(2); // two cards
        out.extend_from_slice(&5u16.to_le_bytes());
        out.extend_from_slice(&9u16.to_le_bytes());
        out
    }

    fn registered_battle() -> BattleState {
        let mut battle = BattleState::new(0x5EED);
        battle
            .handle_opcode(ep3_op::MAP_DEFINITION, &7u32.to_le_bytes())
            .unwrap();
        battle
            .handle_opcode(ep3_op::REGISTER_DECK, &deck_payload(0, "Alice"))
            .unwrap();
        battle
            .handle_opcode(ep3_op::REGISTER_DECK, &deck_payload(1, "Bob"))
            .unwrap();
        battle
    }

    #[test]
    fn registration_to_action_flow() {
        let mut battle = registered_battle();
        assert_eq!(battle.phase, BattlePhase::Registration);
        battle.handle_opcode(ep3_op::READY, &[0]).unwrap();
        assert_eq!(battle.phase, BattlePhase::Registration);
        let events = battle.handle_opcode(ep3_op::READY, &[1]).unwrap();
        assert_eq!(battle.phase, BattlePhase::Setup);
        // The transition emits an extra phase event beyond the echo.
        assert_eq!(events.len(), 2);
        battle.handle_opcode(ep3_op::ADVANCE_PHASE, &[]).unwrap();
        assert_eq!(battle.phase, BattlePhase::Action(ActionSubPhase::Dice));
        assert_eq!(battle.round, 1);
    }

    #[test]
    fn dice_respect_rules_and_seed() {
        let mut battle = registered_battle();
        battle
            .handle_opcode(ep3_op::SET_RULES, &[0, 0, 2, 4, 0xFF, 0])
            .unwrap();
        battle.handle_opcode(ep3_op::READY, &[0]).unwrap();
        battle.handle_opcode(ep3_op::READY, &[1]).unwrap();
        battle.handle_opcode(ep3_op::ADVANCE_PHASE, &[]).unwrap();
        for _ in 0..32 {
            battle.handle_opcode(ep3_op::ROLL_DICE, &[0]).unwrap();
            let [a, b] = battle.dice[0];
            assert!((2..=4).contains(&a) && (2..=4).contains(&b));
        }
        // Same seed, same sequence.
        let run = |seed: u32| -> Vec<[u8; 2]> {
            let mut battle = BattleState::new(seed);
            battle
                .handle_opcode(ep3_op::MAP_DEFINITION, &7u32.to_le_bytes())
                .unwrap();
            battle
                .handle_opcode(ep3_op::REGISTER_DECK, &deck_payload(0, "A"))
                .unwrap();
            battle.handle_opcode(ep3_op::READY, &[0]).unwrap();
            battle.handle_opcode(ep3_op::ADVANCE_PHASE, &[]).unwrap();
            (0..8)
                .map(|_| {
                    battle.handle_opcode(ep3_op::ROLL_DICE, &[0]).unwrap();
                    battle.dice[0]
                })
                .collect()
        };
        assert_eq!(run(1), run(1));
    }

    #[test]
    fn phase_cycle_switches_teams() {
        let mut battle = registered_battle();
        battle.handle_opcode(ep3_op::READY, &[0]).unwrap();
        battle.handle_opcode(ep3_op::READY, &[1]).unwrap();
        battle.handle_opcode(ep3_op::ADVANCE_PHASE, &[]).unwrap();
        assert_eq!(battle.active_team, 0);
        // Walk one full round of sub-phases.
        for _ in 0..5 {
            battle.handle_opcode(ep3_op::ADVANCE_PHASE, &[]).unwrap();
        }
        assert_eq!(battle.round, 2);
        assert_eq!(battle.active_team, 1);
        assert_eq!(battle.phase, BattlePhase::Action(ActionSubPhase::Dice));
    }

    #[test]
    fn out_of_phase_commands_rejected() {
        let mut battle = registered_battle();
        assert!(battle.handle_opcode(ep3_op::ROLL_DICE, &[0]).is_err());
        battle.handle_opcode(ep3_op::READY, &[0]).unwrap();
        battle.handle_opcode(ep3_op::READY, &[1]).unwrap();
        // Registration commands no longer apply.
        assert!(battle
            .handle_opcode(ep3_op::MAP_DEFINITION, &1u32.to_le_bytes())
            .is_err());
    }

    #[test]
    fn battle_result_accumulates_team_exp() {
        let mut battle = registered_battle();
        let mut payload = vec![1u8];
        payload.extend_from_slice(&150u32.to_le_bytes());
        battle.handle_opcode(ep3_op::BATTLE_RESULT, &payload).unwrap();
        assert_eq!(battle.team_exp, [0, 150]);
        assert_eq!(battle.phase, BattlePhase::Finished);
    }
}
