use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::offset::LocalResult;
use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;

use crate::error::{CronField, CronParseError};

/// Highest year a schedule may reach; candidates beyond it mean "never again".
pub const MAX_YEAR: i32 = 2199;
/// Lowest year accepted in the year field.
pub const MIN_YEAR: i32 = 1970;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

// Safety valve for the next-fire search. A one-second schedule crossing a DST
// gap walks the gap second by second; the widest real gap is two hours, so
// this bound is never hit by a satisfiable expression.
const SEARCH_LIMIT: u32 = 100_000;

/// A parsed six- or seven-field cron expression.
///
/// Field order is `seconds minutes hours day-of-month month day-of-week [year]`,
/// with Quartz-style tokens: `*` `,` `-` `/` everywhere, `?` `L` `W` in
/// day-of-month, `?` `L` `#` in day-of-week, and `JAN..DEC` / `SUN..SAT`
/// names (day-of-week is 1–7 with 1 = Sunday). Exactly one of the two day
/// fields must be `?`.
///
/// Calendar arithmetic runs in the expression's time zone (UTC unless
/// [`in_time_zone`](Self::in_time_zone) says otherwise); results come back
/// as UTC instants.
#[derive(Debug, Clone)]
pub struct CronExpression {
    seconds: BTreeSet<u32>,
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days_of_month: BTreeSet<u32>,
    months: BTreeSet<u32>,
    days_of_week: BTreeSet<u32>,
    years: BTreeSet<i32>,

    dom_unspecified: bool,
    last_day_of_month: bool,
    last_day_offset: u32,
    nearest_weekday: bool,

    dow_unspecified: bool,
    last_day_of_week: bool,
    nth_day_of_week: u32,

    time_zone: Tz,
    expression: String,
}

impl CronExpression {
    /// Parse a cron string. Diagnostics name the field, the offending token,
    /// and the reason.
    pub fn parse(expression: &str) -> Result<Self, CronParseError> {
        let normalized = expression.trim().to_ascii_uppercase();
        let fields: Vec<&str> = normalized.split_whitespace().collect();
        if fields.len() != 6 && fields.len() != 7 {
            return Err(CronParseError::FieldCount(fields.len()));
        }

        let seconds = parse_list(CronField::Seconds, fields[0], 0, 59, None)?;
        let minutes = parse_list(CronField::Minutes, fields[1], 0, 59, None)?;
        let hours = parse_list(CronField::Hours, fields[2], 0, 23, None)?;
        let dom = parse_day_of_month(fields[3])?;
        let months = parse_list(CronField::Month, fields[4], 1, 12, Some(&MONTH_NAMES))?;
        let dow = parse_day_of_week(fields[5])?;
        let years: BTreeSet<i32> = if fields.len() == 7 {
            parse_list(CronField::Year, fields[6], MIN_YEAR as u32, MAX_YEAR as u32, None)?
                .into_iter()
                .map(|y| y as i32)
                .collect()
        } else {
            (MIN_YEAR..=MAX_YEAR).collect()
        };

        match (dom.unspecified, dow.unspecified) {
            (false, false) => return Err(CronParseError::ConflictingDayFields),
            (true, true) => {
                return Err(CronParseError::field(
                    CronField::DayOfWeek,
                    "?",
                    "day-of-month and day-of-week cannot both be '?'",
                ));
            }
            _ => {}
        }

        Ok(CronExpression {
            seconds,
            minutes,
            hours,
            days_of_month: dom.days,
            months,
            days_of_week: dow.days,
            years,
            dom_unspecified: dom.unspecified,
            last_day_of_month: dom.last_day,
            last_day_offset: dom.last_offset,
            nearest_weekday: dom.nearest_weekday,
            dow_unspecified: dow.unspecified,
            last_day_of_week: dow.last_of_week,
            nth_day_of_week: dow.nth,
            time_zone: Tz::UTC,
            expression: expression.trim().to_string(),
        })
    }

    /// Evaluate this expression in the given zone instead of UTC.
    pub fn in_time_zone(mut self, tz: Tz) -> Self {
        self.time_zone = tz;
        self
    }

    pub fn time_zone(&self) -> Tz {
        self.time_zone
    }

    /// The smallest instant strictly after `after` matching every field,
    /// or `None` when the expression yields nothing before the year cap.
    ///
    /// Instants that fall into a DST gap in the expression's zone are
    /// skipped; ambiguous instants resolve to their first occurrence.
    pub fn next_valid_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after
            .with_timezone(&self.time_zone)
            .naive_local()
            .with_nanosecond(0)?
            .checked_add_signed(TimeDelta::seconds(1))?;

        let mut year = start.year();
        let mut month = start.month();
        let mut day = start.day();
        let mut hour = start.hour();
        let mut minute = start.minute();
        let mut second = start.second();

        let mut steps = 0u32;
        loop {
            steps += 1;
            if steps > SEARCH_LIMIT || year > MAX_YEAR {
                return None;
            }

            // Seconds.
            match self.seconds.range(second..).next() {
                Some(&s) => second = s,
                None => {
                    second = head(&self.seconds);
                    minute += 1;
                }
            }

            // Minutes.
            match self.minutes.range(minute..).next() {
                Some(&m) => {
                    if m != minute {
                        minute = m;
                        second = head(&self.seconds);
                    }
                }
                None => {
                    minute = head(&self.minutes);
                    second = head(&self.seconds);
                    hour += 1;
                }
            }

            // Hours.
            match self.hours.range(hour..).next() {
                Some(&h) => {
                    if h != hour {
                        hour = h;
                        minute = head(&self.minutes);
                        second = head(&self.seconds);
                    }
                }
                None => {
                    hour = head(&self.hours);
                    minute = head(&self.minutes);
                    second = head(&self.seconds);
                    day += 1;
                }
            }

            // Day, under whichever of day-of-month / day-of-week is concrete.
            match self.next_day(year, month, day) {
                Some(d) => {
                    if d != day {
                        day = d;
                        hour = head(&self.hours);
                        minute = head(&self.minutes);
                        second = head(&self.seconds);
                    }
                }
                None => {
                    month += 1;
                    day = 1;
                    hour = head(&self.hours);
                    minute = head(&self.minutes);
                    second = head(&self.seconds);
                    if month > 12 {
                        month = 1;
                        year += 1;
                    }
                    continue;
                }
            }

            // Month.
            if !self.months.contains(&month) {
                match self.months.range(month..).next() {
                    Some(&mo) => month = mo,
                    None => {
                        month = head(&self.months);
                        year += 1;
                    }
                }
                day = 1;
                hour = head(&self.hours);
                minute = head(&self.minutes);
                second = head(&self.seconds);
                continue;
            }

            // Year.
            if !self.years.contains(&year) {
                match self.years.range(year..).next() {
                    Some(&y) => year = y,
                    None => return None,
                }
                month = head(&self.months);
                day = 1;
                hour = head(&self.hours);
                minute = head(&self.minutes);
                second = head(&self.seconds);
                continue;
            }

            // All fields agree; resolve the civil time in the zone.
            let date = NaiveDate::from_ymd_opt(year, month, day)?;
            let naive = date.and_hms_opt(hour, minute, second)?;
            match self.time_zone.from_local_datetime(&naive) {
                LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                LocalResult::Ambiguous(first, _) => return Some(first.with_timezone(&Utc)),
                LocalResult::None => {
                    // DST gap: this civil time never happens. Resume the
                    // search one second later.
                    let bumped = naive.checked_add_signed(TimeDelta::seconds(1))?;
                    year = bumped.year();
                    month = bumped.month();
                    day = bumped.day();
                    hour = bumped.hour();
                    minute = bumped.minute();
                    second = bumped.second();
                }
            }
        }
    }

    /// Reverse lookup ("latest instant before"). Not supported; always `None`.
    pub fn time_before(&self, _before: DateTime<Utc>) -> Option<DateTime<Utc>> {
        None
    }

    /// Successive fire times strictly after `from`.
    pub fn upcoming(&self, from: DateTime<Utc>) -> Upcoming<'_> {
        Upcoming { cron: self, cursor: from }
    }

    /// Smallest day of (`year`, `month`) that is >= `day` and satisfies the
    /// concrete day field, or `None` when this month has no such day.
    fn next_day(&self, year: i32, month: u32, day: u32) -> Option<u32> {
        let dim = days_in_month(year, month);
        if day > dim {
            return None;
        }

        if !self.dom_unspecified {
            return self.next_day_of_month(year, month, day, dim);
        }
        self.next_day_of_week(year, month, day, dim)
    }

    fn next_day_of_month(&self, year: i32, month: u32, day: u32, dim: u32) -> Option<u32> {
        if self.last_day_of_month {
            if self.last_day_offset >= dim {
                return None;
            }
            let mut target = dim - self.last_day_offset;
            if self.nearest_weekday {
                target = nearest_weekday(year, month, target, dim);
            }
            return (day <= target).then_some(target);
        }
        if self.nearest_weekday {
            // Single 'dW' day; never crosses the month boundary.
            let base = head(&self.days_of_month);
            if base > dim {
                return None;
            }
            let target = nearest_weekday(year, month, base, dim);
            return (day <= target).then_some(target);
        }
        match self.days_of_month.range(day..).next() {
            Some(&d) if d <= dim => Some(d),
            _ => None,
        }
    }

    fn next_day_of_week(&self, year: i32, month: u32, day: u32, dim: u32) -> Option<u32> {
        if self.last_day_of_week {
            let target_dow = head(&self.days_of_week);
            let last_dow = weekday_number(NaiveDate::from_ymd_opt(year, month, dim)?.weekday());
            let target = dim - (last_dow + 7 - target_dow) % 7;
            return (day <= target).then_some(target);
        }
        if self.nth_day_of_week > 0 {
            let target_dow = head(&self.days_of_week);
            let first_dow = weekday_number(NaiveDate::from_ymd_opt(year, month, 1)?.weekday());
            let target = 1 + (target_dow + 7 - first_dow) % 7 + 7 * (self.nth_day_of_week - 1);
            if target > dim {
                return None;
            }
            return (day <= target).then_some(target);
        }
        let current = weekday_number(NaiveDate::from_ymd_opt(year, month, day)?.weekday());
        let delta = match self.days_of_week.range(current..).next() {
            Some(&w) => w - current,
            None => head(&self.days_of_week) + 7 - current,
        };
        let candidate = day + delta;
        (candidate <= dim).then_some(candidate)
    }

    /// Human-readable dump of the parsed field sets.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("seconds: {}\n", render_set(&self.seconds)));
        out.push_str(&format!("minutes: {}\n", render_set(&self.minutes)));
        out.push_str(&format!("hours: {}\n", render_set(&self.hours)));
        out.push_str(&format!("day-of-month: {}\n", self.render_dom()));
        out.push_str(&format!("month: {}\n", render_set(&self.months)));
        out.push_str(&format!("day-of-week: {}\n", self.render_dow()));
        let years = if self.years.len() == (MAX_YEAR - MIN_YEAR + 1) as usize {
            "*".to_string()
        } else {
            self.years.iter().map(|y| y.to_string()).collect::<Vec<_>>().join(",")
        };
        out.push_str(&format!("year: {years}\n"));
        out.push_str(&format!("time-zone: {}\n", self.time_zone));
        out
    }

    fn render_dom(&self) -> String {
        if self.dom_unspecified {
            return "?".to_string();
        }
        if self.last_day_of_month {
            return match (self.last_day_offset, self.nearest_weekday) {
                (0, false) => "L".to_string(),
                (0, true) => "LW".to_string(),
                (n, _) => format!("L-{n}"),
            };
        }
        if self.nearest_weekday {
            return format!("{}W", head(&self.days_of_month));
        }
        render_set(&self.days_of_month)
    }

    fn render_dow(&self) -> String {
        if self.dow_unspecified {
            return "?".to_string();
        }
        if self.last_day_of_week {
            return format!("{}L", head(&self.days_of_week));
        }
        if self.nth_day_of_week > 0 {
            return format!("{}#{}", head(&self.days_of_week), self.nth_day_of_week);
        }
        render_set(&self.days_of_week)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl FromStr for CronExpression {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronExpression::parse(s)
    }
}

/// Iterator over successive fire times of a [`CronExpression`].
pub struct Upcoming<'a> {
    cron: &'a CronExpression,
    cursor: DateTime<Utc>,
}

impl Iterator for Upcoming<'_> {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<DateTime<Utc>> {
        let next = self.cron.next_valid_after(self.cursor)?;
        self.cursor = next;
        Some(next)
    }
}

fn head(set: &BTreeSet<u32>) -> u32 {
    *set.iter().next().unwrap_or(&0)
}

fn render_set(set: &BTreeSet<u32>) -> String {
    set.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(",")
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(31)
}

/// Cron weekday numbering: 1 = Sunday .. 7 = Saturday.
fn weekday_number(weekday: Weekday) -> u32 {
    match weekday {
        Weekday::Sun => 1,
        Weekday::Mon => 2,
        Weekday::Tue => 3,
        Weekday::Wed => 4,
        Weekday::Thu => 5,
        Weekday::Fri => 6,
        Weekday::Sat => 7,
    }
}

/// The Mon–Fri day nearest to `day`, clamped inside the month: a Saturday
/// 1st moves to Monday the 3rd instead of the previous month's Friday, and
/// a Sunday month-end moves back to Friday.
fn nearest_weekday(year: i32, month: u32, day: u32, dim: u32) -> u32 {
    let weekday = match NaiveDate::from_ymd_opt(year, month, day) {
        Some(d) => d.weekday(),
        None => return day,
    };
    match weekday {
        Weekday::Sat => {
            if day == 1 {
                3
            } else {
                day - 1
            }
        }
        Weekday::Sun => {
            if day == dim {
                day - 2
            } else {
                day + 1
            }
        }
        _ => day,
    }
}

struct DomSpec {
    days: BTreeSet<u32>,
    unspecified: bool,
    last_day: bool,
    last_offset: u32,
    nearest_weekday: bool,
}

struct DowSpec {
    days: BTreeSet<u32>,
    unspecified: bool,
    last_of_week: bool,
    nth: u32,
}

fn parse_day_of_month(token: &str) -> Result<DomSpec, CronParseError> {
    let field = CronField::DayOfMonth;
    let mut spec = DomSpec {
        days: BTreeSet::new(),
        unspecified: false,
        last_day: false,
        last_offset: 0,
        nearest_weekday: false,
    };

    if token == "?" {
        spec.unspecified = true;
        return Ok(spec);
    }
    if token == "L" {
        spec.last_day = true;
        return Ok(spec);
    }
    if token == "LW" {
        spec.last_day = true;
        spec.nearest_weekday = true;
        return Ok(spec);
    }
    if let Some(offset) = token.strip_prefix("L-") {
        spec.last_day = true;
        spec.last_offset = parse_bounded(field, token, offset, 1, 30)?;
        return Ok(spec);
    }
    if let Some(day) = token.strip_suffix('W') {
        if token.contains(',') || token.contains('-') || token.contains('/') {
            return Err(CronParseError::field(
                field,
                token,
                "'W' applies to a single day, not a list, range or step",
            ));
        }
        spec.nearest_weekday = true;
        spec.days.insert(parse_bounded(field, token, day, 1, 31)?);
        return Ok(spec);
    }
    if token.contains('L') || token.contains('W') {
        return Err(CronParseError::field(
            field,
            token,
            "'L' and 'W' must stand alone ('L', 'LW', 'L-n' or 'dW')",
        ));
    }

    spec.days = parse_list(field, token, 1, 31, None)?;
    Ok(spec)
}

fn parse_day_of_week(token: &str) -> Result<DowSpec, CronParseError> {
    let field = CronField::DayOfWeek;
    let mut spec = DowSpec {
        days: BTreeSet::new(),
        unspecified: false,
        last_of_week: false,
        nth: 0,
    };

    if token == "?" {
        spec.unspecified = true;
        return Ok(spec);
    }
    // Bare 'L' in day-of-week means Saturday.
    if token == "L" {
        spec.days.insert(7);
        return Ok(spec);
    }
    if let Some((day, nth)) = token.split_once('#') {
        spec.nth = parse_bounded(field, token, nth, 1, 5)?;
        spec.days.insert(parse_value(field, day, 1, 7, Some(&DAY_NAMES))?);
        return Ok(spec);
    }
    if let Some(day) = token.strip_suffix('L') {
        if token.contains(',') || token.contains('-') || token.contains('/') {
            return Err(CronParseError::field(
                field,
                token,
                "'L' applies to a single weekday, not a list, range or step",
            ));
        }
        spec.last_of_week = true;
        spec.days.insert(parse_value(field, day, 1, 7, Some(&DAY_NAMES))?);
        return Ok(spec);
    }

    spec.days = parse_list(field, token, 1, 7, Some(&DAY_NAMES))?;
    Ok(spec)
}

/// Parse a `,`-separated field of `*`, values, `a-b` ranges and `/step`
/// forms into the set of matching values.
fn parse_list(
    field: CronField,
    token: &str,
    min: u32,
    max: u32,
    names: Option<&[&str]>,
) -> Result<BTreeSet<u32>, CronParseError> {
    let mut set = BTreeSet::new();
    for part in token.split(',') {
        if part.is_empty() {
            return Err(CronParseError::field(field, token, "empty list item"));
        }
        if part == "?" {
            return Err(CronParseError::MisplacedQuestionMark);
        }
        parse_item(field, part, min, max, names, &mut set)?;
    }
    if set.is_empty() {
        return Err(CronParseError::field(field, token, "no values"));
    }
    Ok(set)
}

fn parse_item(
    field: CronField,
    part: &str,
    min: u32,
    max: u32,
    names: Option<&[&str]>,
    set: &mut BTreeSet<u32>,
) -> Result<(), CronParseError> {
    let (base, step) = match part.split_once('/') {
        Some((base, step)) => {
            let step = parse_bounded(field, part, step, 1, max.max(1))?;
            (base, Some(step))
        }
        None => (part, None),
    };

    let (start, end) = if base == "*" {
        (min, max)
    } else if let Some((lo, hi)) = base.split_once('-') {
        let lo = parse_value(field, lo, min, max, names)?;
        let hi = parse_value(field, hi, min, max, names)?;
        if lo > hi {
            return Err(CronParseError::field(
                field,
                part,
                format!("inverted range {lo}-{hi}"),
            ));
        }
        (lo, hi)
    } else {
        let value = parse_value(field, base, min, max, names)?;
        // 'v/step' runs from v to the field maximum.
        (value, if step.is_some() { max } else { value })
    };

    let step = step.unwrap_or(1);
    let mut v = start;
    while v <= end {
        set.insert(v);
        v += step;
    }
    Ok(())
}

fn parse_value(
    field: CronField,
    token: &str,
    min: u32,
    max: u32,
    names: Option<&[&str]>,
) -> Result<u32, CronParseError> {
    if let Some(names) = names {
        if let Some(idx) = names.iter().position(|name| *name == token) {
            return Ok(idx as u32 + min);
        }
    }
    parse_bounded(field, token, token, min, max)
}

fn parse_bounded(
    field: CronField,
    token: &str,
    digits: &str,
    min: u32,
    max: u32,
) -> Result<u32, CronParseError> {
    let value: u32 = digits.parse().map_err(|_| {
        let reason = if digits.contains(['L', 'W', '#']) {
            "'L', 'W' and '#' are only valid in the day-of-month or day-of-week field".to_string()
        } else {
            format!("'{digits}' is not a valid value")
        };
        CronParseError::field(field, token, reason)
    })?;
    if value < min || value > max {
        return Err(CronParseError::field(
            field,
            token,
            format!("{value} is outside {min}-{max}"),
        ));
    }
    Ok(value)
}
