//! Episode III tournaments.
//!
//! Named single-elimination brackets. Teams enter during registration;
//! starting a tournament shuffles the seeding, pads the field to a power
//! of two with COM teams, and builds the first round. Winners advance
//! until one team remains; EX result values are handed out at each match
//! end. The whole index persists as one JSON file across restarts.

use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TournamentTeam {
    pub name: String,
    /// Account ids of the human members; empty for COM teams.
    #[serde(default)]
    pub member_account_ids: Vec<u32>,
    #[serde(default)]
    pub is_com: bool,
    /// EX result value accumulated across matches.
    #[serde(default)]
    pub ex_value: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TournamentMatch {
    pub round: u32,
    /// Indexes into the team list; `None` until the feeding match ends.
    pub teams: [Option<usize>; 2],
    pub winner: Option<usize>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TournamentPhase {
    Registration,
    InProgress,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tournament {
    pub name: String,
    pub teams: Vec<TournamentTeam>,
    pub matches: Vec<TournamentMatch>,
    pub phase: TournamentPhase,
    /// Seed used for the bracket shuffle, kept for audit/replay.
    pub shuffle_seed: u64,
}

impl Tournament {
    pub fn new(name: String) -> Tournament {
        Tournament {
            name,
            teams: Vec::new(),
            matches: Vec::new(),
            phase: TournamentPhase::Registration,
            shuffle_seed: 0,
        }
    }

    /// Enter a team during registration.
    pub fn add_team(&mut self, team: TournamentTeam) -> Result<usize, String> {
        if self.phase != TournamentPhase::Registration {
            return Err("tournament has already started".into());
        }
        if self.teams.iter().any(|t| t.name == team.name) {
            return Err(format!("team {:?} already entered", team.name));
        }
        self.teams.push(team);
        Ok(self.teams.len() - 1)
    }

    /// Shuffle seeding, pad to a power of two with COM teams, and build
    /// round one.
    pub fn start(&mut self, shuffle_seed: u64) -> Result<(), String> {
        if self.phase != TournamentPhase::Registration {
            return Err("tournament has already started".into());
        }
        if self.teams.is_empty() {
            return Err("no teams entered".into());
        }

        let bracket_size = self.teams.len().next_power_of_two().max(2);
        let mut com_number = 1;
        while self.teams.len() < bracket_size {
            self.teams.push(TournamentTeam {
                name: format!("COM:{com_number}"),
                member_account_ids: Vec::new(),
                is_com: true,
                ex_value: 0,
            });
            com_number += 1;
        }

        self.shuffle_seed = shuffle_seed;
        let mut order: Vec<usize> = (0..self.teams.len()).collect();
        order.shuffle(&mut StdRng::seed_from_u64(shuffle_seed));

        self.matches.clear();
        for pair in order.chunks(2) {
            self.matches.push(TournamentMatch {
                round: 1,
                teams: [Some(pair[0]), Some(pair[1])],
                winner: None,
            });
        }
        self.phase = TournamentPhase::InProgress;
        Ok(())
    }

    /// Matches whose both teams are known and whose winner is not.
    pub fn pending_matches(&self) -> Vec<usize> {
        self.matches
            .iter()
            .enumerate()
            .filter(|(_, m)| m.winner.is_none() && m.teams.iter().all(Option::is_some))
            .map(|(i, _)| i)
            .collect()
    }

    /// Record a match result and distribute EX values. Builds the next
    /// round's match lazily once its feeders finish.
    pub fn record_result(
        &mut self,
        match_index: usize,
        winning_team: usize,
        ex_values: [u32; 2],
    ) -> Result<(), String> {
        let m = self
            .matches
            .get(match_index)
            .ok_or("no such match")?
            .clone();
        if m.winner.is_some() {
            return Err("match already decided".into());
        }
        if !m.teams.contains(&Some(winning_team)) {
            return Err("winner did not play in this match".into());
        }
        let loser = m
            .teams
            .iter()
            .flatten()
            .copied()
            .find(|&t| t != winning_team);

        self.matches[match_index].winner = Some(winning_team);
        self.teams[winning_team].ex_value += ex_values[0];
        if let Some(loser) = loser {
            self.teams[loser].ex_value += ex_values[1];
        }

        // Pair round winners in match order.
        let round = m.round;
        let winners: Vec<usize> = self
            .matches
            .iter()
            .filter(|m| m.round == round)
            .filter_map(|m| m.winner)
            .collect();
        let round_size = self.matches.iter().filter(|m| m.round == round).count();
        if winners.len() == round_size {
            if round_size == 1 {
                self.phase = TournamentPhase::Complete;
            } else {
                for pair in winners.chunks(2) {
                    self.matches.push(TournamentMatch {
                        round: round + 1,
                        teams: [Some(pair[0]), pair.get(1).copied()],
                        winner: None,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn champion(&self) -> Option<&TournamentTeam> {
        if self.phase != TournamentPhase::Complete {
            return None;
        }
        self.matches
            .last()
            .and_then(|m| m.winner)
            .map(|i| &self.teams[i])
    }
}

/// The named-tournament registry, persisted as one JSON document.
pub struct TournamentIndex {
    path: PathBuf,
    inner: RwLock<HashMap<String, Tournament>>,
}

impl TournamentIndex {
    pub fn load(path: &str) -> TournamentIndex {
        let path = PathBuf::from(path);
        let tournaments = match std::fs::read_to_string(&path) {
            Ok(json) => match serde_json::from_str::<Vec<Tournament>>(&json) {
                Ok(list) => {
                    info!(count = list.len(), "Loaded tournament index");
                    list.into_iter().map(|t| (t.name.clone(), t)).collect()
                }
                Err(e) => {
                    warn!(error = %e, "Tournament file is unreadable; starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        TournamentIndex {
            path,
            inner: RwLock::new(tournaments),
        }
    }

    /// Persist the whole index.
    pub fn save(&self) {
        let inner = self.inner.read();
        let mut list: Vec<&Tournament> = inner.values().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        let json = match serde_json::to_string_pretty(&list) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize tournaments");
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&self.path, json) {
            warn!(error = %e, path = %self.path.display(), "Failed to persist tournaments");
        }
    }

    pub fn create(&self, name: &str) -> Result<(), String> {
        let mut inner = self.inner.write();
        if inner.contains_key(name) {
            return Err(format!("tournament {name:?} already exists"));
        }
        inner.insert(name.to_string(), Tournament::new(name.to_string()));
        drop(inner);
        self.save();
        Ok(())
    }

    pub fn delete(&self, name: &str) -> bool {
        let removed = self.inner.write().remove(name).is_some();
        if removed {
            self.save();
        }
        removed
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Run a closure against one tournament, persisting afterwards.
    pub fn with_tournament<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Tournament) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.write();
        let result = inner.get_mut(name).map(f);
        drop(inner);
        if result.is_some() {
            self.save();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn team(name: &str) -> TournamentTeam {
        TournamentTeam {
            name: name.into(),
            member_account_ids: vec![],
            is_com: false,
            ex_value: 0,
        }
    }

    #[test]
    fn bracket_pads_with_com_teams() {
        let mut t = Tournament::new("cup".into());
        t.add_team(team("red")).unwrap();
        t.add_team(team("blue")).unwrap();
        t.add_team(team("green")).unwrap();
        t.start(42).unwrap();
        assert_eq!(t.teams.len(), 4);
        assert_eq!(t.teams.iter().filter(|t| t.is_com).count(), 1);
        assert_eq!(t.matches.len(), 2);
        assert_eq!(t.pending_matches().len(), 2);
    }

    #[test]
    fn duplicate_team_rejected() {
        let mut t = Tournament::new("cup".into());
        t.add_team(team("red")).unwrap();
        assert!(t.add_team(team("red")).is_err());
    }

    #[test]
    fn progression_to_champion() {
        let mut t = Tournament::new("cup".into());
        for name in ["a", "b", "c", "d"] {
            t.add_team(team(name)).unwrap();
        }
        t.start(7).unwrap();

        let first = t.pending_matches();
        assert_eq!(first.len(), 2);
        let winner_0 = t.matches[first[0]].teams[0].unwrap();
        t.record_result(first[0], winner_0, [3, 1]).unwrap();
        let winner_1 = t.matches[first[1]].teams[1].unwrap();
        t.record_result(first[1], winner_1, [3, 1]).unwrap();

        // The final was created from both winners.
        let finals = t.pending_matches();
        assert_eq!(finals.len(), 1);
        let final_match = &t.matches[finals[0]];
        assert_eq!(final_match.round, 2);
        assert_eq!(
            final_match.teams,
            [Some(winner_0), Some(winner_1)]
        );

        t.record_result(finals[0], winner_1, [3, 1]).unwrap();
        assert_eq!(t.phase, TournamentPhase::Complete);
        assert_eq!(t.champion().unwrap().name, t.teams[winner_1].name);
        // Winner of two matches collected two win values.
        assert_eq!(t.teams[winner_1].ex_value, 6);
    }

    #[test]
    fn shuffle_is_seed_stable() {
        let build = |seed: u64| {
            let mut t = Tournament::new("cup".into());
            for name in ["a", "b", "c", "d", "e"] {
                t.add_team(team(name)).unwrap();
            }
            t.start(seed).unwrap();
            t.matches.clone()
        };
        assert_eq!(build(9), build(9));
        assert_ne!(build(9), build(10));
    }

    #[test]
    fn invalid_results_rejected() {
        let mut t = Tournament::new("cup".into());
        t.add_team(team("a")).unwrap();
        t.add_team(team("b")).unwrap();
        t.start(1).unwrap();
        assert!(t.record_result(0, 99, [3, 1]).is_err());
        let winner = t.matches[0].teams[0].unwrap();
        t.record_result(0, winner, [3, 1]).unwrap();
        assert!(t.record_result(0, winner, [3, 1]).is_err());
    }

    #[test]
    fn index_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tournaments.json");
        let path_str = path.to_string_lossy().into_owned();
        {
            let index = TournamentIndex::load(&path_str);
            index.create("summer-cup").unwrap();
            index
                .with_tournament("summer-cup", |t| {
                    t.add_team(team("red")).unwrap();
                    t.add_team(team("blue")).unwrap();
                    t.start(3).unwrap();
                })
                .unwrap();
        }
        let reloaded = TournamentIndex::load(&path_str);
        assert_eq!(reloaded.names(), vec!["summer-cup".to_string()]);
        reloaded
            .with_tournament("summer-cup", |t| {
                assert_eq!(t.phase, TournamentPhase::InProgress);
                assert_eq!(t.teams.len(), 2);
            })
            .unwrap();
    }
}
