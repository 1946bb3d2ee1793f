use anyhow::Result;
use bpf_common::TableSpec;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use sentinel_core::{
    AttachedProbe, HookPointRegistry, ProbeStatus, diagnostics::Diagnostics,
};

pub struct TermPrinted;

pub trait TermPrintable {
    fn term_print(&self) -> Result<TermPrinted>;
}

impl TermPrintable for String {
    fn term_print(&self) -> Result<TermPrinted> {
        println!("{self}");
        Ok(TermPrinted)
    }
}

impl TermPrintable for HookPointRegistry {
    fn term_print(&self) -> Result<TermPrinted> {
        let mut table = table();

        table.set_header(header(&[
            "ID",
            "HOOK POINT",
            "PROBES",
            "EVENT TYPES",
            "TABLES",
            "OPTIONAL",
        ]));

        for (id, hook_point) in self.all().iter().enumerate() {
            let probes: Vec<String> = hook_point
                .probes()
                .iter()
                .map(|probe| format!("{} {}", probe.kind, probe.symbol))
                .collect();
            let event_types: Vec<String> = hook_point
                .event_types()
                .iter()
                .map(|(selector, capabilities)| format!("{selector}: {capabilities}"))
                .collect();
            let tables: Vec<&str> = hook_point.tables().collect();

            table.add_row(vec![
                Cell::new(id),
                Cell::new(hook_point.name())
                    .fg(Color::Cyan)
                    .add_attribute(Attribute::Bold),
                Cell::new(probes.join("\n")),
                Cell::new(event_types.join("\n")),
                Cell::new(tables.join("\n")),
                Cell::new(if hook_point.is_optional() { "yes" } else { "no" }),
            ]);
        }

        println!("{table}");
        Ok(TermPrinted)
    }
}

impl TermPrintable for Vec<TableSpec> {
    fn term_print(&self) -> Result<TermPrinted> {
        let mut table = table();

        table.set_header(header(&[
            "TABLE",
            "KEY",
            "VALUE",
            "MAX ENTRIES",
            "READ DISCIPLINE",
        ]));

        for spec in self {
            table.add_row(vec![
                Cell::new(spec.name())
                    .fg(Color::Cyan)
                    .add_attribute(Attribute::Bold),
                Cell::new(&spec.key_layout),
                Cell::new(&spec.value_layout),
                Cell::new(spec.max_entries),
                Cell::new(spec.read_discipline),
            ]);
        }

        println!("{table}");
        Ok(TermPrinted)
    }
}

impl TermPrintable for Vec<AttachedProbe> {
    fn term_print(&self) -> Result<TermPrinted> {
        let mut table = table();

        table.set_header(header(&["HOOK POINT", "KIND", "SYMBOL", "STATUS"]));

        for probe in self {
            let status_color = match probe.status {
                ProbeStatus::Attached => Color::Green,
                ProbeStatus::SkippedOptional => Color::Yellow,
                ProbeStatus::Failed => Color::Red,
            };

            table.add_row(vec![
                Cell::new(&probe.hook_point)
                    .fg(Color::Cyan)
                    .add_attribute(Attribute::Bold),
                Cell::new(probe.kind),
                Cell::new(probe.symbol.as_deref().unwrap_or("-")),
                Cell::new(probe.status)
                    .fg(status_color)
                    .add_attribute(Attribute::Bold),
            ]);
        }

        println!("{table}");
        Ok(TermPrinted)
    }
}

impl TermPrintable for Diagnostics {
    fn term_print(&self) -> Result<TermPrinted> {
        let mut table = table();

        table.set_header(header(&["CONSUMER", "CAPABILITIES", "DELIVERED", "DROPPED"]));

        for consumer in &self.consumers {
            let dropped_color = if consumer.dropped == 0 {
                Color::Green
            } else {
                Color::Yellow
            };
            table.add_row(vec![
                Cell::new(consumer.handle),
                Cell::new(&consumer.capabilities),
                Cell::new(consumer.delivered),
                Cell::new(consumer.dropped).fg(dropped_color),
            ]);
        }

        println!("events dispatched: {}", self.dispatched);
        println!("malformed records: {}", self.decode_errors);
        if !self.degraded.is_empty() {
            println!("degraded hook points: {}", self.degraded.join(", "));
        }
        println!("drain: {}", self.drain);
        println!("{table}");
        Ok(TermPrinted)
    }
}

fn header(names: &[&str]) -> Vec<Cell> {
    names
        .iter()
        .map(|name| Cell::new(name).add_attribute(Attribute::Bold))
        .collect()
}

fn table() -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table
}
