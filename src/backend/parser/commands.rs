//! Hash Command Resolution
//!
//! Resolves the outcome of a hash command found in a closing body. Dice
//! and roulette consult the process random source; the counter commands
//! consult the store so the persisted outcome stays causally ordered
//! with the close.

use chrono::Utc;
use rand::Rng;

use crate::backend::db::{Result, Store};
use crate::shared::config::MAX_DICE_SIDES;
use crate::shared::post::Command;

/// Maximum number of dice in a single roll
const MAX_DICE: u32 = 10;

/// Chambers in the roulette cylinder
pub const ROULETTE_CHAMBERS: u8 = 6;

const EIGHTBALL: [&str; 8] = [
    "Yes",
    "No",
    "Maybe",
    "It is certain",
    "Ask again later",
    "Outlook not so good",
    "Better not tell you now",
    "Very doubtful",
];

/// Resolve a matched command word (without the leading `#`). Returns
/// None for syntactically matched but semantically invalid commands,
/// such as oversized dice.
pub async fn resolve(
    word: &str,
    board: &str,
    op: u64,
    store: &dyn Store,
) -> Result<Option<Command>> {
    // The thread-local RNG must not be held across store awaits, so it
    // is scoped to each arm.
    Ok(match word {
        "flip" => Some(Command::Flip(rand::thread_rng().gen())),
        "8ball" => {
            let answer = EIGHTBALL[rand::thread_rng().gen_range(0..EIGHTBALL.len())];
            Some(Command::EightBall(answer.to_string()))
        }
        "pyu" => Some(Command::Pyu(store.pyu_increment(board).await?)),
        "pcount" => Some(Command::Pcount(store.pyu_count(board).await?)),
        "rcount" => Some(Command::Rcount(store.rcount(op).await?)),
        "roulette" => {
            let outcome = rand::thread_rng().gen_range(1..=ROULETTE_CHAMBERS);
            Some(Command::Roulette([outcome, ROULETTE_CHAMBERS]))
        }
        word if word.starts_with("sw") => parse_syncwatch(word),
        word => roll_dice(word, &mut rand::thread_rng()),
    })
}

/// Whether a resolved command is a roulette loss
pub fn is_roulette_loss(command: &Command) -> bool {
    matches!(command, Command::Roulette([1, _]))
}

fn roll_dice(word: &str, rng: &mut impl Rng) -> Option<Command> {
    // Format: NdM, N defaulting to 1
    let (count, sides) = word.split_once('d')?;
    let count: u32 = if count.is_empty() {
        1
    } else {
        count.parse().ok()?
    };
    let sides: u32 = sides.parse().ok()?;
    if count == 0 || count > MAX_DICE || sides == 0 || sides > MAX_DICE_SIDES {
        return None;
    }
    let rolls = (0..count)
        .map(|_| rng.gen_range(1..=sides) as u16)
        .collect();
    Some(Command::Dice(rolls))
}

/// Parse `sw[H:]M:S[+-offset]` into a synchronised watch window
/// anchored at the current time
fn parse_syncwatch(word: &str) -> Option<Command> {
    let body = word.strip_prefix("sw")?;
    let (body, offset) = match body.find(['+', '-']) {
        Some(at) => {
            let offset: i64 = body[at..].parse().ok()?;
            (&body[..at], offset)
        }
        None => (body, 0),
    };

    let parts: Vec<u64> = body
        .split(':')
        .map(|p| p.parse().ok())
        .collect::<Option<_>>()?;
    let (hours, minutes, seconds) = match parts[..] {
        [m, s] => (0, m, s),
        [h, m, s] => (h, m, s),
        _ => return None,
    };

    let duration = (hours * 3600 + minutes * 60 + seconds) as i64;
    let start = Utc::now().timestamp() + offset;
    Some(Command::SyncWatch([
        hours,
        minutes,
        seconds,
        start as u64,
        (start + duration) as u64,
    ]))
}
