use std::{fmt::Display, time::Duration};

use chrono::{Datelike, NaiveDate};
use teloxide::types::UserId;

/// A punishment for mentioning someone who asked not to be mentioned.
///
/// There are two independent axes. [`Sanction::Warning`] and the mutes are the mute axis,
/// exactly one of which is issued per violation. Media bans are the media axis, at most
/// one of which is issued in addition to it.
///
/// Sanctions on the same axis compare by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Sanction {
    /// Just a message in the chat.
    Warning,
    /// Can't send anything for 5 minutes.
    MuteFiveMin,
    /// Can't send anything for an hour.
    MuteHour,
    /// Can't send anything for a day.
    MuteDay,
    /// Can only send text for a week.
    MediaBanWeek,
    /// Can only send text for 31 days.
    MediaBanMonth,
}

impl Sanction {
    /// How long the restriction this sanction implies lasts.
    /// Returns [`None`] for [`Sanction::Warning`], which restricts nothing.
    #[must_use]
    pub fn duration(self) -> Option<Duration> {
        const MINUTE: u64 = 60;
        const HOUR: u64 = 60 * MINUTE;
        const DAY: u64 = 24 * HOUR;

        let secs = match self {
            Sanction::Warning => return None,
            Sanction::MuteFiveMin => 5 * MINUTE,
            Sanction::MuteHour => HOUR,
            Sanction::MuteDay => DAY,
            Sanction::MediaBanWeek => 7 * DAY,
            Sanction::MediaBanMonth => 31 * DAY,
        };
        Some(Duration::from_secs(secs))
    }

    /// Returns `true` if this sanction is on the media axis.
    #[must_use]
    pub fn is_media_ban(self) -> bool {
        matches!(self, Sanction::MediaBanWeek | Sanction::MediaBanMonth)
    }
}

impl Display for Sanction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Sanction::Warning => "a warning",
            Sanction::MuteFiveMin => "a 5 minute mute",
            Sanction::MuteHour => "an hour long mute",
            Sanction::MuteDay => "a day long mute",
            Sanction::MediaBanWeek => "a week long media ban",
            Sanction::MediaBanMonth => "a month long media ban",
        };
        f.write_str(text)
    }
}

/// Decide on sanctions for a violation, given the violation counters *after* accounting it.
///
/// The first element is always the mute axis sanction; the second one, if present, is
/// a media ban.
#[must_use]
pub fn derive_sanctions(violations_today: u32, violations_month: u32) -> Vec<Sanction> {
    let today = violations_today;
    let month = violations_month;

    let mute = if month == 1 {
        Sanction::Warning
    } else if today <= 2 && month < 10 {
        Sanction::MuteFiveMin
    } else if today < 5 && month < 30 {
        Sanction::MuteHour
    } else {
        Sanction::MuteDay
    };

    // Heavier ban goes first, or it'd never be reached past 30 monthly violations.
    let media = if month > 50 {
        Some(Sanction::MediaBanMonth)
    } else if today == 5 || month > 30 {
        Some(Sanction::MediaBanWeek)
    } else {
        None
    };

    let mut sanctions = Vec::with_capacity(2);
    sanctions.push(mute);
    sanctions.extend(media);
    sanctions
}

/// Violation history of a single user in a single chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolationRecord {
    /// UTC date of the latest violation.
    pub last_active_date: NaiveDate,
    pub violations_today: u32,
    pub violations_month: u32,
    /// Never goes down.
    pub violations_total: u32,
    /// Users that were mentioned in the latest violation.
    pub last_offended_mentions: Vec<UserId>,
}

impl ViolationRecord {
    /// Record for someone's very first violation.
    #[must_use]
    pub fn first(date: NaiveDate, offended_mentions: Vec<UserId>) -> Self {
        Self {
            last_active_date: date,
            violations_today: 1,
            violations_month: 1,
            violations_total: 1,
            last_offended_mentions: offended_mentions,
        }
    }

    /// Returns `true` if the counters make sense: `1 <= today <= month <= total`.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        1 <= self.violations_today
            && self.violations_today <= self.violations_month
            && self.violations_month <= self.violations_total
    }

    /// Account one more violation that happened on `date`.
    pub fn register(&mut self, date: NaiveDate, offended_mentions: Vec<UserId>) {
        let last = self.last_active_date;
        let same_month = last.year() == date.year() && last.month() == date.month();

        if date == last {
            self.violations_today += 1;
            self.violations_month += 1;
        } else if same_month {
            self.violations_today = 1;
            self.violations_month += 1;
        } else {
            self.violations_today = 1;
            self.violations_month = 1;
        }
        self.violations_total += 1;
        self.last_active_date = date;
        self.last_offended_mentions = offended_mentions;
    }

    /// Counters as they'd look on `date`: days and months that have passed since the
    /// last violation count as clean. Returns `(today, month, total)`.
    #[must_use]
    pub fn counters_as_of(&self, date: NaiveDate) -> (u32, u32, u32) {
        let last = self.last_active_date;
        let same_month = last.year() == date.year() && last.month() == date.month();

        let today = if last == date { self.violations_today } else { 0 };
        let month = if same_month { self.violations_month } else { 0 };
        (today, month, self.violations_total)
    }
}
