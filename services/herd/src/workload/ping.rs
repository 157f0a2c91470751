//! Ping-pong latency benchmark
//!
//! Every rank runs `threads` workers. A worker issues `work_load` requests,
//! one at a time, to recipients picked by the selection strategy and waits for
//! each answer before sending the next. A dispatcher on the calling thread
//! answers the requests this rank receives and announces when all of its own
//! workers are done; a rank stops once it has announced and heard the
//! announcement of every other rank.
//!
//! Requests always travel on the control lane. In shared mode the answers
//! come back there too and the dispatcher hands them to the waiting worker;
//! in dedicated mode worker `i` reads its answers straight off data line `i`.
//!
//! Usage: `ping [WORK_LOAD] [SELECTION] [THREADS] [shared|dedicated]`,
//! defaults from the configuration.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context as _, Result};
use codec::Message;
use herd_config::{PingMode, WorkloadConfig};
use network::{Channel, ChannelSelector, Rank};
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use tracing::debug;

use crate::daemon::Context;

const REQUEST: i32 = 1;
const RESPONSE: i32 = 2;
const FINISHED: i32 = 3;

#[derive(Debug, Clone, PartialEq)]
struct Settings {
    work_load: usize,
    selection: u32,
    threads: usize,
    mode: PingMode,
}

impl Settings {
    fn parse(defaults: &WorkloadConfig, args: &[String]) -> Result<Self> {
        let settings = Self {
            work_load: argument(args, 0, "work load")?.unwrap_or(defaults.work_load),
            selection: argument(args, 1, "selection")?.unwrap_or(defaults.selection),
            threads: argument(args, 2, "thread count")?.unwrap_or(defaults.threads),
            mode: argument(args, 3, "mode")?.unwrap_or(defaults.mode),
        };
        if settings.threads == 0 {
            bail!("at least one ping thread is needed");
        }
        Ok(settings)
    }
}

fn argument<T>(args: &[String], index: usize, what: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    args.get(index)
        .map(|arg| {
            arg.parse::<T>()
                .map_err(|e| anyhow!("{}", e))
                .with_context(|| format!("invalid {} '{}'", what, arg))
        })
        .transpose()
}

pub(super) fn run(context: &Context<'_>, args: &[String]) -> Result<i32> {
    let settings = Settings::parse(context.workload(), args)?;
    let rank = context.rank();
    let world = context.world_size();
    if world < 2 {
        println!("ping {}/{}: nobody to ping", rank, world);
        return Ok(0);
    }
    if settings.mode == PingMode::Dedicated && settings.threads > context.data_channels() {
        bail!(
            "dedicated mode needs a data line per thread: {} threads, {} data channels",
            settings.threads,
            context.data_channels()
        );
    }
    recipients(settings.selection, rank, world)?;

    let board = Board::new(settings.threads);
    let started = Instant::now();

    let tallies = thread::scope(|scope| {
        let workers: Vec<_> = (0..settings.threads)
            .map(|id| {
                let (settings, board) = (&settings, &board);
                scope.spawn(move || {
                    let outcome = worker(context, settings, board, id);
                    board.completed.fetch_add(1, Ordering::SeqCst);
                    outcome
                })
            })
            .collect();

        let dispatched = dispatch(context, &settings, &board);
        if dispatched.is_err() {
            board.abort.store(true, Ordering::SeqCst);
        }
        let joined = workers
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("ping worker panicked")))
            })
            .collect::<Result<Vec<Tally>>>();
        dispatched.and(joined)
    })?;

    let total = tallies.iter().fold(Tally::default(), |sum, tally| Tally {
        answered: sum.answered + tally.answered,
        round_trips: sum.round_trips + tally.round_trips,
    });
    let mean = total
        .round_trips
        .checked_div(total.answered.max(1) as u32)
        .unwrap_or_default();
    println!(
        "ping {}/{}: {} round trips in {:.3} s, mean round trip {:.1} us (selection {}, {} {} workers)",
        rank,
        world,
        total.answered,
        started.elapsed().as_secs_f64(),
        mean.as_secs_f64() * 1e6,
        settings.selection,
        settings.threads,
        settings.mode
    );
    Ok(0)
}

/// State shared by the dispatcher and the workers of one rank
struct Board {
    mailboxes: Vec<Mailbox>,
    completed: AtomicUsize,
    abort: AtomicBool,
}

impl Board {
    fn new(threads: usize) -> Self {
        Self {
            mailboxes: (0..threads).map(|_| Mailbox::default()).collect(),
            completed: AtomicUsize::new(0),
            abort: AtomicBool::new(false),
        }
    }

    /// Block until the dispatcher posts worker `id`'s answer
    fn answer_for(&self, id: usize, poll: Duration) -> Result<i32> {
        loop {
            if self.abort.load(Ordering::SeqCst) {
                bail!("dispatcher gave up");
            }
            if let Some(value) = self.mailboxes[id].take(poll) {
                return Ok(value);
            }
        }
    }
}

/// One-slot hand-off from the dispatcher to a waiting worker
#[derive(Default)]
struct Mailbox {
    slot: Mutex<Option<i32>>,
    posted: Condvar,
}

impl Mailbox {
    fn post(&self, value: i32) {
        *self.slot.lock() = Some(value);
        self.posted.notify_one();
    }

    fn take(&self, timeout: Duration) -> Option<i32> {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            self.posted.wait_for(&mut slot, timeout);
        }
        slot.take()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    answered: usize,
    round_trips: Duration,
}

fn worker(context: &Context<'_>, settings: &Settings, board: &Board, id: usize) -> Result<Tally> {
    let mut next = recipients(settings.selection, context.rank(), context.world_size())?;
    let worker_id = i32::try_from(id)?;
    let mut tally = Tally::default();

    for sequence in 0..settings.work_load {
        // Never zero, so the negated answer differs from the request.
        let value = i32::try_from(sequence % i32::MAX as usize)? + 1;
        let target = next();

        let mut request = Message::data(REQUEST);
        request.push_i32(worker_id)?.push_i32(value)?;
        let sent_at = Instant::now();
        if !context.send_to(target, &mut request, ChannelSelector::Master)? {
            bail!("rank {} is not reachable", target);
        }

        let answer = match settings.mode {
            PingMode::Shared => board.answer_for(id, context.poll_interval())?,
            PingMode::Dedicated => dedicated_answer(context, board, target, id)?,
        };
        if answer != -value {
            bail!("rank {} answered {} to {}", target, answer, value);
        }
        tally.answered += 1;
        tally.round_trips += sent_at.elapsed();
    }
    debug!(worker = id, answered = tally.answered, "Ping worker done");
    Ok(tally)
}

fn dedicated_answer(context: &Context<'_>, board: &Board, target: Rank, id: usize) -> Result<i32> {
    loop {
        if board.abort.load(Ordering::SeqCst) {
            bail!("dispatcher gave up");
        }
        let Some(message) =
            context.receive_from(target, ChannelSelector::Data(id), context.poll_interval())?
        else {
            continue;
        };
        if message.tag() != RESPONSE {
            bail!("unexpected tag {} on data line {}", message.tag(), id);
        }
        let mut reader = message.reader();
        reader.read_i32()?;
        return Ok(reader.read_i32()?);
    }
}

/// Answer requests and route answers until every rank announced completion
fn dispatch(context: &Context<'_>, settings: &Settings, board: &Board) -> Result<()> {
    let world = context.world_size();
    let mut finished = HashSet::new();
    let mut announced = false;
    let mut failure = None;

    loop {
        if !announced && board.completed.load(Ordering::SeqCst) == settings.threads {
            if !context.send_all(&mut Message::data(FINISHED), ChannelSelector::Master) {
                bail!("announcing completion failed");
            }
            announced = true;
        }
        if announced && finished.len() == world - 1 {
            return Ok(());
        }

        context.probe(
            ChannelSelector::Master,
            |channel: Channel| match handle(context, settings.mode, board, &mut finished, channel) {
                Ok(()) => true,
                Err(e) => {
                    failure = Some(e);
                    false
                }
            },
            Some(context.poll_interval()),
        )?;
        if let Some(e) = failure.take() {
            return Err(e);
        }
    }
}

/// Consume one data frame off the control lane
fn handle(
    context: &Context<'_>,
    mode: PingMode,
    board: &Board,
    finished: &mut HashSet<Rank>,
    channel: Channel,
) -> Result<()> {
    let message = channel.receive()?;
    match message.tag() {
        REQUEST => {
            let mut reader = message.reader();
            let worker = reader.read_i32()?;
            let value = reader.read_i32()?;
            let lane = match mode {
                PingMode::Shared => ChannelSelector::Master,
                PingMode::Dedicated => ChannelSelector::Data(usize::try_from(worker)?),
            };

            let mut response = Message::data(RESPONSE);
            response.push_i32(worker)?.push_i32(-value)?;
            if !context.send_to(message.from(), &mut response, lane)? {
                bail!("rank {} vanished", message.from());
            }
        }
        RESPONSE => {
            let mut reader = message.reader();
            let worker = usize::try_from(reader.read_i32()?)?;
            let value = reader.read_i32()?;
            match board.mailboxes.get(worker) {
                Some(mailbox) => mailbox.post(value),
                None => debug!(worker, "Answer for no such worker"),
            }
        }
        FINISHED => {
            finished.insert(message.from());
        }
        tag => debug!(tag, from = message.from(), "Ignoring data frame"),
    }
    Ok(())
}

/// Recipient picker for a selection strategy
///
/// 1: the next rank, cyclic; 2: round-robin over the other ranks;
/// 3: a pseudo-random other rank.
fn recipients(selection: u32, rank: Rank, world: usize) -> Result<Box<dyn FnMut() -> Rank>> {
    let others: Vec<Rank> = (1..=world)
        .filter_map(|other| Rank::try_from(other).ok())
        .filter(|&other| other != rank)
        .collect();
    if others.is_empty() {
        bail!("rank {} has nobody to ping", rank);
    }

    match selection {
        1 => {
            let next = Rank::try_from(usize::from(rank) % world + 1)?;
            Ok(Box::new(move || next))
        }
        2 => {
            let mut turn = 0;
            Ok(Box::new(move || {
                let other = others[turn % others.len()];
                turn += 1;
                other
            }))
        }
        3 => {
            let mut rng = rand::thread_rng();
            Ok(Box::new(move || others[rng.gen_range(0..others.len())]))
        }
        other => bail!("unknown selection strategy {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(words: &[&str]) -> Vec<String> {
        words.iter().map(|word| word.to_string()).collect()
    }

    #[test]
    fn test_next_rank_wraps() {
        let mut pick = recipients(1, 3, 3).unwrap();
        assert_eq!(pick(), 1);
        let mut pick = recipients(1, 1, 3).unwrap();
        assert_eq!(pick(), 2);
        assert_eq!(pick(), 2);
    }

    #[test]
    fn test_round_robin_skips_self() {
        let mut pick = recipients(2, 2, 4).unwrap();
        let picks: Vec<Rank> = (0..6).map(|_| pick()).collect();
        assert_eq!(picks, vec![1, 3, 4, 1, 3, 4]);
    }

    #[test]
    fn test_random_never_picks_self() {
        let mut pick = recipients(3, 2, 5).unwrap();
        for _ in 0..200 {
            let other = pick();
            assert_ne!(other, 2);
            assert!((1..=5).contains(&other));
        }
    }

    #[test]
    fn test_unknown_strategy_and_lonely_rank() {
        assert!(recipients(9, 1, 3).is_err());
        assert!(recipients(1, 1, 1).is_err());
    }

    #[test]
    fn test_settings_fall_back_to_configuration() {
        let defaults = WorkloadConfig {
            work_load: 7,
            selection: 2,
            threads: 3,
            mode: PingMode::Shared,
        };
        assert_eq!(
            Settings::parse(&defaults, &[]).unwrap(),
            Settings {
                work_load: 7,
                selection: 2,
                threads: 3,
                mode: PingMode::Shared
            }
        );
        assert_eq!(
            Settings::parse(&defaults, &args(&["40", "1", "2", "dedicated"])).unwrap(),
            Settings {
                work_load: 40,
                selection: 1,
                threads: 2,
                mode: PingMode::Dedicated
            }
        );
        assert!(Settings::parse(&defaults, &args(&["many"])).is_err());
        assert!(Settings::parse(&defaults, &args(&["1", "1", "0"])).is_err());
        assert!(Settings::parse(&defaults, &args(&["1", "1", "1", "both"])).is_err());
    }

    #[test]
    fn test_mailbox_hands_over_across_threads() {
        let board = Board::new(2);
        thread::scope(|scope| {
            scope.spawn(|| {
                thread::sleep(Duration::from_millis(20));
                board.mailboxes[1].post(-42);
            });
            assert_eq!(board.answer_for(1, Duration::from_millis(5)).unwrap(), -42);
        });
        assert_eq!(board.mailboxes[0].take(Duration::from_millis(5)), None);

        board.abort.store(true, Ordering::SeqCst);
        assert!(board.answer_for(0, Duration::from_millis(5)).is_err());
    }
}
