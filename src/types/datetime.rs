//! The datetime record: a struct-typed value broken into calendar and
//! time-of-day fields. Parsing datetime text is outside the engine; this
//! module only defines the record layout and its rendering.

use std::fmt;

use super::{Type, make_struct, make_type};

/// A datetime broken into fields, matching the layout of
/// [`datetime_struct_type`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct DatetimeStruct {
  /// Calendar year.
  pub year: i16,
  /// Month, 1-12.
  pub month: i8,
  /// Day of month, 1-31.
  pub day: i8,
  /// Hour, 0-23.
  pub hour: i8,
  /// Minute, 0-59.
  pub minute: i8,
  /// Second, 0-59.
  pub second: i8,
  /// Sub-second ticks, 100ns units.
  pub tick: i32,
}

impl DatetimeStruct {
  /// Whether the fields form a plausible calendar datetime.
  #[must_use] pub fn is_valid(&self) -> bool {
    (1..=12).contains(&self.month)
      && (1..=31).contains(&self.day)
      && (0..24).contains(&self.hour)
      && (0..60).contains(&self.minute)
      && (0..60).contains(&self.second)
      && (0..10_000_000).contains(&self.tick)
  }
}

impl fmt::Display for DatetimeStruct {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if !self.is_valid() {
      return Ok(());
    }
    write!(f, "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}", self.year, self.month, self.day,
      self.hour, self.minute, self.second)
  }
}

/// The struct type of a datetime record.
pub fn datetime_struct_type() -> Type {
  make_struct(&[
    (make_type::<i16>(), "year"),
    (make_type::<i8>(), "month"),
    (make_type::<i8>(), "day"),
    (make_type::<i8>(), "hour"),
    (make_type::<i8>(), "minute"),
    (make_type::<i8>(), "second"),
    (make_type::<i32>(), "tick"),
  ]).expect("datetime fields are fixed-size")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn renders_iso_style() {
    let dt = DatetimeStruct { year: 2014, month: 3, day: 7, hour: 16, minute: 5, second: 30,
      tick: 0 };
    assert!(dt.is_valid());
    assert_eq!(dt.to_string(), "2014-03-07T16:05:30");
    assert_eq!(DatetimeStruct::default().to_string(), "");
  }

  #[test]
  fn type_layout_matches_the_record() {
    let tp = datetime_struct_type();
    assert_eq!(tp.element_size(), std::mem::size_of::<DatetimeStruct>());
    assert_eq!(tp.alignment(), 4);
  }
}
