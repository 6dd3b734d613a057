use std::{collections::BTreeSet, io::Write};

use anyhow::{Error, anyhow, bail, ensure};

use crate::{
    coverage::FactStore,
    lock::{AbstractLock, LockId, LockSet},
    query::RaceCandidate,
    thread::{ThreadId, ThreadRelation, ThreadStateSet},
    usage::{AccessKind, UsagePoint},
};

/// Renders the abstract part of a usage point, e.g.
/// `WRITE:[t2:{t1=PARENT_THREAD,t2=CREATED_THREAD},[]]`.
pub fn render(point: &UsagePoint) -> String {
    let state: Vec<String> = point
        .state()
        .iter()
        .map(|(thread, rel)| format!("{}={}", thread, rel))
        .collect();

    format!(
        "{}:[{}:{{{}}},{}]",
        point.access(),
        point.thread(),
        state.join(","),
        point.locks()
    )
}

/// A usage point as written in an annotation, without location or site.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Annotation {
    pub access: AccessKind,
    pub thread: ThreadId,
    pub state: ThreadStateSet,
    pub locks: LockSet,
}

impl Annotation {
    pub fn matches(&self, point: &UsagePoint) -> bool {
        self.access == point.access()
            && &self.thread == point.thread()
            && &self.state == point.state()
            && &self.locks == point.locks()
    }
}

struct Cursor<'a> {
    input: &'a str,
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, rest: input }
    }

    fn skip_whitespace(&mut self) {
        self.rest = self.rest.trim_start();
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_whitespace();
        if let Some(rest) = self.rest.strip_prefix(token) {
            self.rest = rest;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> Result<(), Error> {
        ensure!(
            self.eat(token),
            "Expected `{}` at offset {} of `{}`",
            token,
            self.input.len() - self.rest.len(),
            self.input
        );
        Ok(())
    }

    fn ident(&mut self) -> Result<&'a str, Error> {
        self.skip_whitespace();
        let end = self
            .rest
            .find(|c: char| c.is_whitespace() || ":[]{}=,|()".contains(c))
            .unwrap_or(self.rest.len());
        if end == 0 {
            bail!(
                "Expected an identifier at offset {} of `{}`",
                self.input.len() - self.rest.len(),
                self.input
            );
        }
        let (ident, rest) = self.rest.split_at(end);
        self.rest = rest;
        Ok(ident)
    }

    fn finish(&mut self) -> Result<(), Error> {
        self.skip_whitespace();
        if self.rest.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("Trailing input `{}` in `{}`", self.rest, self.input))
        }
    }
}

fn parse_lock(cursor: &mut Cursor) -> Result<AbstractLock, Error> {
    if !cursor.eat("(") {
        return Ok(AbstractLock::Exact(LockId::new(cursor.ident()?)));
    }

    let mut aliases = BTreeSet::from([LockId::new(cursor.ident()?)]);
    while cursor.eat("|") {
        aliases.insert(LockId::new(cursor.ident()?));
    }
    cursor.expect(")")?;

    AbstractLock::from_aliases(aliases).ok_or_else(|| anyhow!("Empty alias set"))
}

/// Parses the textual form produced by [`render`]. Whitespace between tokens
/// is ignored.
///
/// # Errors
///
/// Returns an error if the text is not a well-formed usage point.
pub fn parse(text: &str) -> Result<Annotation, Error> {
    let mut cursor = Cursor::new(text);

    let access = cursor.ident()?.parse::<AccessKind>()?;
    cursor.expect(":")?;
    cursor.expect("[")?;
    let thread = ThreadId::new(cursor.ident()?);
    cursor.expect(":")?;

    cursor.expect("{")?;
    let mut relations = Vec::new();
    if !cursor.eat("}") {
        loop {
            let id = ThreadId::new(cursor.ident()?);
            cursor.expect("=")?;
            relations.push((id, cursor.ident()?.parse::<ThreadRelation>()?));
            if !cursor.eat(",") {
                break;
            }
        }
        cursor.expect("}")?;
    }
    cursor.expect(",")?;

    cursor.expect("[")?;
    let mut locks = Vec::new();
    if !cursor.eat("]") {
        loop {
            locks.push(parse_lock(&mut cursor)?);
            if !cursor.eat(",") {
                break;
            }
        }
        cursor.expect("]")?;
    }
    cursor.expect("]")?;
    cursor.finish()?;

    Ok(Annotation {
        access,
        thread,
        state: relations.into_iter().collect(),
        locks: locks.into_iter().collect(),
    })
}

/// An encoder to emit analysis results in a line-based text format
pub struct StdFormatEncoder;

impl StdFormatEncoder {
    pub fn new() -> Self {
        Self {}
    }

    fn encode_race(&self, race: &RaceCandidate) -> String {
        format!(
            "race({})|{}@{}|{}@{}",
            race.location,
            race.first,
            race.first.site(),
            race.second,
            race.second.site()
        )
    }

    /// Writes every retained usage point followed by the race candidates.
    pub fn encode<W: Write>(
        &mut self,
        store: &FactStore,
        races: &[RaceCandidate],
        mut output: W,
    ) -> Result<(), Error> {
        for (location, antichain) in store.iter() {
            for point in antichain.iter() {
                writeln!(output, "{}|{}|{}", location, point, point.site())?
            }
        }

        for race in races {
            writeln!(output, "{}", self.encode_race(race))?
        }

        Ok(())
    }

    pub fn format(&self) -> &'static str {
        "STD"
    }
}

impl Default for StdFormatEncoder {
    fn default() -> Self {
        Self::new()
    }
}
