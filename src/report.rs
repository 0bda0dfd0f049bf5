/**
 * Summary report over reconciled records
 */

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::reconcile::{Conflict, FieldClass, ReconciledRecord};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassCounts {
    pub both_agree: usize,
    pub stored_only: usize,
    pub sidecar_only: usize,
    pub neither: usize,
    pub conflicted: usize,
}

impl ClassCounts {
    fn add(&mut self, class: FieldClass) {
        *self.slot(class) += 1;
    }

    fn slot(&mut self, class: FieldClass) -> &mut usize {
        match class {
            FieldClass::BothAgree => &mut self.both_agree,
            FieldClass::StoredOnly => &mut self.stored_only,
            FieldClass::SidecarOnly => &mut self.sidecar_only,
            FieldClass::Neither => &mut self.neither,
            FieldClass::Conflicted => &mut self.conflicted,
        }
    }

    pub fn get(&self, class: FieldClass) -> usize {
        match class {
            FieldClass::BothAgree => self.both_agree,
            FieldClass::StoredOnly => self.stored_only,
            FieldClass::SidecarOnly => self.sidecar_only,
            FieldClass::Neither => self.neither,
            FieldClass::Conflicted => self.conflicted,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummaryReport {
    pub total: usize,
    pub datetime: ClassCounts,
    pub gps: ClassCounts,
    // Combined availability over usable (non-conflicted) records
    pub datetime_and_gps: usize,
    pub datetime_only: usize,
    pub gps_only: usize,
    pub neither: usize,
    pub conflicted: usize,
    pub conflicts: Vec<(String, Vec<Conflict>)>,
}

impl SummaryReport {
    pub fn from_records(records: &BTreeMap<String, ReconciledRecord>) -> Self {
        let mut report = SummaryReport {
            total: records.len(),
            ..Default::default()
        };

        for (filename, record) in records {
            report.datetime.add(record.datetime_class);
            report.gps.add(record.gps_class);

            if record.conflicted {
                report.conflicted += 1;
                report.conflicts.push((filename.clone(), record.conflicts.clone()));
                continue;
            }

            match (record.metadata.has_datetime(), record.metadata.has_gps()) {
                (true, true) => report.datetime_and_gps += 1,
                (true, false) => report.datetime_only += 1,
                (false, true) => report.gps_only += 1,
                (false, false) => report.neither += 1,
            }
        }

        report
    }

    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        // Writing to a String cannot fail
        let _ = self.write_markdown(&mut out);
        out
    }

    fn write_markdown(&self, out: &mut String) -> std::fmt::Result {
        writeln!(out, "# Photo metadata restoration report")?;
        writeln!(out)?;
        writeln!(out, "Total files: {}", self.total)?;
        writeln!(out)?;

        writeln!(out, "## Metadata sources")?;
        writeln!(out)?;
        write!(out, "| Field |")?;
        for class in FieldClass::ALL {
            write!(out, " {} |", class.label())?;
        }
        writeln!(out)?;
        write!(out, "|---|")?;
        for _ in FieldClass::ALL {
            write!(out, "---:|")?;
        }
        writeln!(out)?;
        for (name, counts) in [("Datetime", &self.datetime), ("GPS", &self.gps)] {
            write!(out, "| {} |", name)?;
            for class in FieldClass::ALL {
                write!(out, " {} |", counts.get(class))?;
            }
            writeln!(out)?;
        }
        writeln!(out)?;

        writeln!(out, "## Combined")?;
        writeln!(out)?;
        writeln!(out, "| Category | Files |")?;
        writeln!(out, "|---|---:|")?;
        writeln!(out, "| Datetime + GPS | {} |", self.datetime_and_gps)?;
        writeln!(out, "| Datetime only | {} |", self.datetime_only)?;
        writeln!(out, "| GPS only | {} |", self.gps_only)?;
        writeln!(out, "| Neither | {} |", self.neither)?;
        writeln!(out, "| Conflicted | {} |", self.conflicted)?;
        writeln!(out)?;

        writeln!(out, "## Conflicts")?;
        writeln!(out)?;
        if self.conflicts.is_empty() {
            writeln!(out, "No conflicts.")?;
        }
        for (filename, conflicts) in &self.conflicts {
            writeln!(out, "### {}", filename)?;
            writeln!(out)?;
            for conflict in conflicts {
                writeln!(
                    out,
                    "- {} ({}): `{}` vs `{}`",
                    conflict.field, conflict.between, conflict.first, conflict.second
                )?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    pub fn print_table(&self) {
        println!("\n=== Reconciliation Summary ===");
        println!("Total files: {}", self.total);
        println!("{:<18} {:>10} {:>10}", "", "Datetime", "GPS");
        for class in FieldClass::ALL {
            println!("{:<18} {:>10} {:>10}", class.label(), self.datetime.get(class), self.gps.get(class));
        }
        println!();
        println!("Datetime + GPS:    {}", self.datetime_and_gps);
        println!("Datetime only:     {}", self.datetime_only);
        println!("GPS only:          {}", self.gps_only);
        println!("Neither:           {}", self.neither);
        println!("Conflicted:        {}", self.conflicted);

        if !self.conflicts.is_empty() {
            println!("\nConflicted files:");
            for (filename, conflicts) in self.conflicts.iter().take(10) {
                for conflict in conflicts {
                    println!("  {}: {}", filename, conflict);
                }
            }
            if self.conflicts.len() > 10 {
                println!("  ... and {} more (see report.md)", self.conflicts.len() - 10);
            }
        }
    }
}
